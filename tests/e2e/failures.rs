use crate::*;

#[test]
fn failing_command_stops_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "A: B C { cat B C >A }\nB: { exit 1 }\nC: { echo ok >C }\n",
    )?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert!(!space.exists("A"));
    assert_stderr_contains(&out, "failed with exit status 1");
    Ok(())
}

#[test]
fn keep_going_builds_independent_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "A: B C { cat B C >A }\nB: { exit 1 }\nC: { echo ok >C }\n",
    )?;
    let out = space.run(&mut stu_command(vec!["-k", "A"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert!(!space.exists("A"));
    assert_eq!(space.read("C")?, b"ok\n");
    Ok(())
}

#[test]
fn ambiguous_rules_exit_2() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">a.$x: { echo 1 }\n>$y.txt: { echo 2 }\n",
    )?;
    let out = space.run(&mut stu_command(vec!["a.txt"]))?;
    assert_eq!(out.status.code(), Some(2));
    assert_stderr_contains(&out, "two matching rules");
    // Both rule places are named.
    assert_stderr_contains(&out, "main.stu:1:");
    assert_stderr_contains(&out, "main.stu:2:");
    Ok(())
}

#[test]
fn missing_file_exit_1() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: B { cat B >A }\n")?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_stderr_contains(&out, "does not exist");
    assert_stderr_contains(&out, "needed by");
    Ok(())
}

#[test]
fn missing_transient_rule_exit_2() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: { echo a }\n")?;
    let out = space.run(&mut stu_command(vec!["@nothing"]))?;
    assert_eq!(out.status.code(), Some(2));
    Ok(())
}

#[test]
fn syntax_error_exit_2() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: B\n")?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(2));
    Ok(())
}

#[test]
fn cycle_exit_2() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: B { touch A }\nB: A { touch B }\n")?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(2));
    assert_stderr_contains(&out, "circular dependency");
    Ok(())
}

#[test]
fn usage_error_exit_4() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut stu_command(vec!["-f"]))?;
    assert_eq!(out.status.code(), Some(4));
    let out = space.run(&mut stu_command(vec!["-f", "", "A"]))?;
    assert_eq!(out.status.code(), Some(4));
    let out = space.run(&mut stu_command(vec!["--no-such-option"]))?;
    assert_eq!(out.status.code(), Some(4));
    Ok(())
}

#[test]
fn missing_script_exit_2() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(2));
    Ok(())
}

#[test]
fn failed_redirect_output_leaves_no_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: { echo partial; exit 1 }\n")?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert!(!space.exists("A"));
    Ok(())
}

#[test]
fn command_must_create_its_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: { true }\n")?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_stderr_contains(&out, "did not create");
    Ok(())
}

#[test]
fn needed_by_chain_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "A: B { cat B >A }\nB: C { cat C >B }\n",
    )?;
    let out = space.run(&mut stu_command(vec!["A"]))?;
    assert_eq!(out.status.code(), Some(1));
    let stderr = std::str::from_utf8(&out.stderr)?;
    assert!(stderr.contains("needed by \"B\"") || stderr.contains("needed by B"));
    Ok(())
}
