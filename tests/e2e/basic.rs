use crate::*;

#[test]
fn basic_build_then_up_to_date() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "A: B { cat B >A }\nB: { echo ok >B }\n",
    )?;

    // First run builds B then A, with nothing on stdout.
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(std::str::from_utf8(&out.stdout)?, "");
    assert_eq!(space.read("B")?, b"ok\n");
    assert_eq!(space.read("A")?, b"ok\n");

    // Second run does nothing.
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");

    Ok(())
}

#[test]
fn default_target_is_first_rule() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: B { cat B }\n>B: { echo data }\n",
    )?;
    space.run_expect(&mut stu_command(vec![]))?;
    assert_eq!(space.read("A")?, b"data\n");
    Ok(())
}

#[test]
fn rebuild_when_dependency_is_newer() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: B { cat B >A }\n")?;
    space.write("B", "one\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"one\n");

    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("B", "two\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"two\n");

    Ok(())
}

#[test]
fn parameterized_rule() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "out.$x: in.$x { cat in.$x >out.$x }\n")?;
    space.write("in.alpha", "aaa\n")?;
    space.write("in.beta", "bbb\n")?;
    space.run_expect(&mut stu_command(vec!["out.alpha", "out.beta"]))?;
    assert_eq!(space.read("out.alpha")?, b"aaa\n");
    assert_eq!(space.read("out.beta")?, b"bbb\n");
    Ok(())
}

#[test]
fn parameterized_output_redirection_is_rejected() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">out.$x: in.$x { cat in.$x }\n")?;
    let out = space.run(&mut stu_command(vec!["out.alpha"]))?;
    assert_eq!(out.status.code(), Some(2));
    assert_stderr_contains(&out, "output redirection");
    Ok(())
}

#[test]
fn transient_bundle_builds_all_members() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "@all: A B;\n>A: { echo a }\n>B: { echo b }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["@all"]))?;
    assert_eq!(space.read("A")?, b"a\n");
    assert_eq!(space.read("B")?, b"b\n");
    Ok(())
}

#[test]
fn hardcoded_content() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A = { hello }\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b" hello ");

    // Unchanged content is not rewritten.
    let out = space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_output_contains(&out, "Targets are up to date");
    Ok(())
}

#[test]
fn variable_dependency_in_environment() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        ">A: $[V=B] { echo \"got $V\" }\n>B: { printf val }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"got val\n");
    Ok(())
}

#[test]
fn variable_dependency_default_name() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: $[B] { echo \"B is $B\" }\n>B: { printf 7 }\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"B is 7\n");
    Ok(())
}

#[test]
fn input_redirection() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: <B { tr a-z A-Z }\n")?;
    space.write("B", "abc\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    assert_eq!(space.read("A")?, b"ABC\n");
    Ok(())
}

#[test]
fn output_redirection_into_subdirectory() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">gen/out: { echo deep }\n")?;
    space.run_expect(&mut stu_command(vec!["gen/out"]))?;
    assert_eq!(space.read("gen/out")?, b"deep\n");
    Ok(())
}

#[test]
fn silent_mode_suppresses_up_to_date() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A = { x }\n")?;
    space.run_expect(&mut stu_command(vec!["A"]))?;
    let out = space.run_expect(&mut stu_command(vec!["-s", "A"]))?;
    assert_eq!(std::str::from_utf8(&out.stdout)?, "");
    Ok(())
}

#[test]
fn question_mode() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", "A: B { cat B >A }\n")?;
    space.write("B", "x\n")?;

    // Out of date: exit 1, nothing built.
    let out = space.run(&mut stu_command(vec!["-q", "A"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert!(!space.exists("A"));

    // Build, then question mode reports up to date.
    space.run_expect(&mut stu_command(vec!["A"]))?;
    let out = space.run(&mut stu_command(vec!["-q", "A"]))?;
    assert_eq!(out.status.code(), Some(0));

    Ok(())
}

#[test]
fn parallel_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "main.stu",
        "@all: A B C D;\n\
         >A: { echo a }\n\
         >B: { echo b }\n\
         >C: { echo c }\n\
         >D: { echo d }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["-j", "3", "@all"]))?;
    for name in ["A", "B", "C", "D"] {
        assert!(space.exists(name));
    }
    Ok(())
}

#[test]
fn command_runs_at_most_once_for_shared_dependency() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // Both A and B depend on C; C appends to a log when run.
    space.write(
        "main.stu",
        "@all: A B;\n\
         >A: C { cat C }\n\
         >B: C { cat C }\n\
         C: { echo c >C; echo ran >>log }\n",
    )?;
    space.run_expect(&mut stu_command(vec!["@all"]))?;
    assert_eq!(space.read("log")?, b"ran\n");
    Ok(())
}

#[test]
fn version_flag() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut stu_command(vec!["-V"]))?;
    assert_eq!(out.status.code(), Some(0));
    assert_output_contains(&out, "stu ");
    Ok(())
}

#[test]
fn statistics_flag() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: { echo a }\n")?;
    let out = space.run_expect(&mut stu_command(vec!["-z", "A"]))?;
    assert_output_contains(&out, "STATISTICS");
    Ok(())
}

#[test]
fn source_from_command_line() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut stu_command(vec!["-C", ">A: { echo x }", "A"]))?;
    assert!(out.status.success());
    assert_eq!(space.read("A")?, b"x\n");
    Ok(())
}

#[test]
fn literal_target_option() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.stu", ">A: { echo a }\n")?;
    space.run_expect(&mut stu_command(vec!["-c", "A"]))?;
    assert!(space.exists("A"));
    Ok(())
}

#[test]
fn script_from_stdin() -> anyhow::Result<()> {
    use std::io::Write;
    let space = TestSpace::new()?;
    let mut cmd = stu_command(vec!["-f", "-", "A"]);
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.current_dir(space.path());
    let mut child = cmd.spawn()?;
    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(b">A: { echo from-stdin }\n")?;
    let out = child.wait_with_output()?;
    assert!(out.status.success());
    assert_eq!(space.read("A")?, b"from-stdin\n");
    Ok(())
}
