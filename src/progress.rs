//! Console reporting.
//!
//! Commands are echoed to stderr so that target stdout stays clean; the
//! up-to-date message and statistics go to stdout.

/// Counts kept for `-z` statistics and SIGUSR1 snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counts {
    pub run: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Progress {
    silent: bool,
}

impl Progress {
    pub fn new(silent: bool) -> Progress {
        Progress { silent }
    }

    /// Echo a command about to run.
    pub fn command(&self, text: &str) {
        if self.silent {
            return;
        }
        eprintln!("{}", text.trim());
    }

    pub fn up_to_date(&self) {
        if self.silent {
            return;
        }
        println!("Targets are up to date");
    }

    /// The `-z` statistics block, printed on exit.
    pub fn statistics(&self, counts: &Counts) {
        println!("STATISTICS  commands run       {}", counts.run);
        println!("STATISTICS  commands succeeded {}", counts.succeeded);
        println!("STATISTICS  commands failed    {}", counts.failed);
    }

    /// The SIGUSR1 snapshot: current counts plus running target names.
    pub fn snapshot(&self, counts: &Counts, running: &[String]) {
        println!(
            "stu: running {}, succeeded {}, failed {}",
            running.len(),
            counts.succeeded,
            counts.failed
        );
        for name in running {
            println!("stu:   running {}", name);
        }
    }
}
