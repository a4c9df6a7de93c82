use crate::*;

#[test]
fn optional_dependency_with_rule_is_built() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // An optional dependency that has a rule is built like any other.
    space.write(
        "main.stu",
        ">A: ?B { cat B }\n>B: { echo b }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"b\n");
    assert_eq!(space.read("B")?, b"b\n");
    Ok(())
}

#[test]
fn optional_missing_dependency_without_rule_is_skipped() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // No rule for B and no file on disk: the optional edge short-circuits
    // instead of failing.
    space.write(
        "main.stu",
        ">A: ?B { test ! -f B && echo none }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"none\n");
    Ok(())
}

#[test]
fn optional_existing_dependency_is_used() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: ?B { cat B }\n")?;
    space.write("B", "present\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"present\n");
    Ok(())
}

#[test]
fn persistent_dependency_does_not_trigger_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: -p B { cat B >A }\n")?;
    space.write("B", "one\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"one\n");

    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("B", "two\n")?;
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");
    assert_eq!(space.read("A")?, b"one\n");
    Ok(())
}

#[test]
fn ignore_timestamp_dependency_does_not_trigger_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: !B { cat B >A }\n")?;
    space.write("B", "one\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;

    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("B", "two\n")?;
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");
    Ok(())
}

#[test]
fn trivial_dependency_cannot_rebuild_by_itself() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "A: -t B { echo run >>count; cat B >A }\n>B: { echo b }\n",
    )?;
    // First build: A is missing, so everything including B is built.
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"b\n");
    assert!(space.exists("B"));

    // Make B newer than A: a trivial edge alone does not rebuild A.
    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("B", "newer\n")?;
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");
    assert_eq!(space.read("count")?, b"run\n");
    Ok(())
}

#[test]
fn trivial_dependency_participates_when_forced() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "A: C -t B { cat B C >A }\n>B: { echo b }\n",
    )?;
    space.write("C", "c\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;

    // A non-trivial reason (C newer) rebuilds A, and the trivial B is
    // brought up to date first.
    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("C", "c2\n")?;
    std::fs::remove_file(space.path().join("B"))?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"b\nc2\n");
    Ok(())
}

#[test]
fn persistent_flag_propagates_across_dynamic_expansion() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "A: -p [L] { cat x >A }\n>L: { echo x }\n",
    )?;
    space.write("x", "one\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"one\n");

    // x is newer now, but inherits -p through the dynamic layer.
    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("x", "two\n")?;
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");
    Ok(())
}

#[test]
fn concatenation_builds_the_cross_product() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: (x y)*(.1 .2) { cat x.1 x.2 y.1 y.2 }\n",
    )?;
    for name in ["x.1", "x.2", "y.1", "y.2"] {
        space.write(name, &format!("{}\n", name))?;
    }
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"x.1\nx.2\ny.1\ny.2\n");
    Ok(())
}

#[test]
fn concatenation_with_missing_element_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: x*.1 { cat x.1 }\n")?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(1));
    Ok(())
}
