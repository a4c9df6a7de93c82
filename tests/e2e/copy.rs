use crate::*;

#[test]
fn copy_rule() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A = B;\n")?;
    space.write("B", "payload\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"payload\n");

    // The copy preserves the source's modification time.
    let src = space.metadata("B")?.modified()?;
    let dst = space.metadata("A")?.modified()?;
    assert_eq!(src, dst);

    // Nothing to do on a second run.
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");
    Ok(())
}

#[test]
fn copy_rule_with_trailing_slash() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "out/foo = src/;\n")?;
    space.mkdir("src")?;
    space.write("src/foo", "from src\n")?;
    space.run_expect(&mut stu_command(vec!["out/foo"]))?;
    assert_eq!(space.read("out/foo")?, b"from src\n");
    Ok(())
}

#[test]
fn copy_rule_recopies_when_source_is_newer() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A = B;\n")?;
    space.write("B", "one\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;

    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("B", "two\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"two\n");
    Ok(())
}

#[test]
fn forced_copy_rule_always_copies() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A = !B;\n")?;
    space.write("B", "data\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    // A second run copies again even though A is up to date.
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    let stdout = std::str::from_utf8(&out.stdout)?;
    assert!(!stdout.contains("Targets are up to date"));
    Ok(())
}

#[test]
fn copied_source_is_built_first() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A = B;\n>B: { echo generated }\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"generated\n");
    Ok(())
}

#[test]
fn parameterized_copy_rule() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "out.$x = in.$x;\n")?;
    space.write("in.a", "av\n")?;
    space.run_expect(&mut stu_command(vec!["out.a"]))?;
    assert_eq!(space.read("out.a")?, b"av\n");
    Ok(())
}
