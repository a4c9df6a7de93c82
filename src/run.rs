//! Command-line surface and top-level driver.

use crate::dep::{Dep, DirectDep};
use crate::error::{self, Error, Place, Styles};
use crate::name::{ParamName, ParamTarget, TargetKind};
use crate::parse;
use crate::progress::Progress;
use crate::rule::RuleSet;
use crate::signal;
use crate::tokenize;
use crate::work::{self, Work};
use crate::dynlist::Separator;
use argh::FromArgs;
use std::io::Read;
use std::rc::Rc;

#[derive(argh::FromArgs)]
/// stu, a build tool with parameterized rules and dynamic dependencies
struct Opts {
    /// read FILE as the script instead of 'main.stu'; '-' reads stdin
    #[argh(option, short = 'f')]
    file: Option<String>,

    /// treat TEXT as a single target name, without interpreting syntax
    #[argh(option, short = 'c')]
    literal_target: Vec<String>,

    /// read TEXT as additional script source
    #[argh(option, short = 'C')]
    source: Vec<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// keep going after a failed target; build independent targets
    #[argh(switch, short = 'k')]
    keep_going: bool,

    /// keep partially built files on error
    #[argh(switch, short = 'K')]
    keep_partial: bool,

    /// silent operation
    #[argh(switch, short = 's')]
    silent: bool,

    /// print version and exit
    #[argh(switch, short = 'V')]
    version: bool,

    /// question mode: exit 0 if targets are up to date, 1 otherwise
    #[argh(switch, short = 'q')]
    question: bool,

    /// treat dynamic dependency files as newline-separated by default
    #[argh(switch, short = 'n')]
    newline: bool,

    /// treat dynamic dependency files as NUL-separated by default
    #[argh(switch, short = '0')]
    nul: bool,

    /// print statistics on exit
    #[argh(switch, short = 'z')]
    statistics: bool,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

const DEFAULT_FILE: &str = "main.stu";

pub fn run() -> i32 {
    let styles = Styles::from_env();
    match run_impl(&styles) {
        Ok(code) => code,
        Err(err) => {
            err.print(&styles);
            err.kind.exit_bit()
        }
    }
}

fn run_impl(styles: &Styles) -> error::Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    let arg_refs: Vec<&str> = args.iter().skip(1).map(|s| s.as_str()).collect();
    let cmd = args.first().map(|s| s.as_str()).unwrap_or("stu");
    let opts: Opts = match Opts::from_args(&[cmd], &arg_refs) {
        Ok(opts) => opts,
        Err(early) => {
            return Ok(match early.status {
                Ok(()) => {
                    println!("{}", early.output);
                    0
                }
                Err(()) => {
                    eprintln!("{}", early.output);
                    4
                }
            });
        }
    };

    if opts.version {
        println!("stu {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }
    if let Some(file) = &opts.file {
        if file.is_empty() {
            eprintln!("stu: option -f must not have an empty argument");
            return Ok(4);
        }
    }
    if opts.jobs == Some(0) {
        eprintln!("stu: argument to -j must be positive");
        return Ok(4);
    }

    let mut rules = RuleSet::new();

    // The script file: -f FILE, stdin for '-', or the default main.stu.
    // With -C as the only source, a missing default file is not an error.
    let filename = opts.file.clone().unwrap_or_else(|| DEFAULT_FILE.to_string());
    let script: Option<(Rc<str>, Vec<u8>)> = if filename == "-" {
        let mut text = Vec::new();
        std::io::stdin().read_to_end(&mut text).map_err(|e| {
            Error::system(Place::None, format!("read standard input: {}", e))
        })?;
        Some(("<stdin>".into(), text))
    } else {
        match std::fs::read(&filename) {
            Ok(text) => Some((filename.as_str().into(), text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if opts.file.is_none() && !opts.source.is_empty() {
                    None
                } else {
                    return Err(Error::logical(
                        Place::None,
                        format!("file {} does not exist", styles.word(&filename)),
                    ));
                }
            }
            Err(e) => {
                return Err(Error::system(
                    Place::None,
                    format!("read {}: {}", filename, e),
                ));
            }
        }
    };

    if let Some((name, text)) = &script {
        load_rules(&mut rules, text, name, styles)?;
    }
    for (i, text) in opts.source.iter().enumerate() {
        let name: Rc<str> = if opts.source.len() == 1 {
            "<option -C>".into()
        } else {
            format!("<option -C #{}>", i + 1).into()
        };
        load_rules(&mut rules, text.as_bytes(), &name, styles)?;
    }

    // Assemble the top-level dependencies.
    let mut deps: Vec<Rc<Dep>> = Vec::new();
    for text in &opts.targets {
        deps.push(parse::parse_target_expression(text)?);
    }
    for text in &opts.literal_target {
        if text.is_empty() {
            return Err(Error::logical(
                Place::Argv,
                "target name must not be empty",
            ));
        }
        deps.push(Rc::new(Dep::Direct(DirectDep::new(
            0,
            ParamTarget {
                kind: TargetKind::File,
                name: ParamName::plain(text.as_str()),
                place: Place::Argv,
            },
        ))));
    }
    if deps.is_empty() {
        match rules.first_target() {
            Some(target) => {
                deps.push(Rc::new(Dep::Direct(DirectDep::new(
                    0,
                    ParamTarget {
                        kind: target.kind,
                        name: ParamName::plain(target.name.as_str()),
                        place: Place::None,
                    },
                ))));
            }
            None => {
                return Err(Error::logical(
                    Place::None,
                    "no target to build and no rules",
                ));
            }
        }
    }

    signal::register();

    let options = work::Options {
        parallelism: opts.jobs.unwrap_or_else(default_parallelism),
        keep_going: opts.keep_going,
        question: opts.question,
        silent: opts.silent,
        keep_partial: opts.keep_partial,
        default_sep: if opts.nul {
            Separator::Nul
        } else if opts.newline {
            Separator::Newline
        } else {
            Separator::Stu
        },
    };

    let progress = Progress::new(opts.silent);
    let mut work = Work::new(&rules, options, &progress, *styles);
    for dep in &deps {
        work.want(dep)?;
    }
    let summary = work.run()?;

    if opts.statistics {
        progress.statistics(&summary.counts);
    }
    if opts.question {
        return Ok(if summary.out_of_date || summary.error != 0 {
            1
        } else {
            0
        });
    }
    if summary.error != 0 {
        return Ok(summary.error as i32);
    }
    if summary.commands_run == 0 {
        progress.up_to_date();
    }
    Ok(0)
}

fn load_rules(
    rules: &mut RuleSet,
    text: &[u8],
    filename: &Rc<str>,
    styles: &Styles,
) -> error::Result<()> {
    let (tokens, place_end) = tokenize::tokenize(text, filename)?;
    for rule in parse::parse_rules(&tokens, &place_end, styles)? {
        rules.add(rule, styles)?;
    }
    Ok(())
}
