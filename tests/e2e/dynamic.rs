use crate::*;

#[test]
fn simple_dynamic_dependency() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: [B] { cat C D }\n>B: { echo C D }\n>C: { echo ccc }\n>D: { echo ddd }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"ccc\nddd\n");
    Ok(())
}

#[test]
fn doubly_dynamic_dependency() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: [[B]] { cat D E }\n\
         >B: { echo C }\n\
         >C: { echo D E }\n\
         >D: { echo ddd }\n\
         >E: { echo eee }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"ddd\neee\n");

    // B and C each ran exactly once; everything is now up to date.
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");
    Ok(())
}

#[test]
fn nul_separated_dynamic_list_missing_deps_fail() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: [-0 B] { cat }\n>B: { printf 'x\\0y\\0' }\n",
    )?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert!(!space.exists("A"));
    Ok(())
}

#[test]
fn nul_separated_dynamic_list_builds_deps() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: [-0 B] { cat x y }\n>B: { printf 'x\\0y\\0' }\n",
    )?;
    space.write("x", "1\n")?;
    space.write("y", "2\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"1\n2\n");
    Ok(())
}

#[test]
fn newline_separated_dynamic_list() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: [-n B] { cat x y }\n>B: { printf 'x\\ny\\n' }\n",
    )?;
    space.write("x", "1\n")?;
    space.write("y", "2\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"1\n2\n");
    Ok(())
}

#[test]
fn newline_separated_by_default_with_option() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: [B] { cat x }\n>B: { echo x }\n",
    )?;
    space.write("x", "1\n")?;
    space.run_expect(&mut stu_command(vec!["-n", "A"]))?;
    assert_eq!(space.read("A")?, b"1\n");
    Ok(())
}

#[test]
fn dynamic_list_with_quoting_and_flags() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // B lists an optional, nonexistent file; A still builds.
    space.write(
        "main.stu",
        ">A: [B] { cat x }\n>B: { echo \"x -o missing\" }\n",
    )?;
    space.write("x", "1\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"1\n");
    Ok(())
}

#[test]
fn dynamic_list_built_by_parameterized_rule() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: [list.first] { cat in.1 }\n\
         list.$x: { echo in.$x | sed s/first/1/ >list.$x }\n",
    )?;
    space.write("in.1", "one\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"one\n");
    Ok(())
}

#[test]
fn command_line_dynamic_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">B: { echo C }\n>C: { echo ccc }\n",
    )?;
    // Requesting [B] on the command line builds B's listed deps.
    space.run_expect(&mut stu_command(vec!["[B]"]))?;
    assert_eq!(space.read("C")?, b"ccc\n");
    Ok(())
}
