//! Error taxonomy and diagnostic rendering.
//!
//! Errors fall into five kinds.  Syntax and logical errors come from the
//! script and exit with status 2; build errors come from failed commands and
//! exit with status 1; the two can combine to 3 when -k keeps going past
//! both.  System and fatal errors are always terminal.  Status 4 is reserved
//! for command-line usage errors and never produced here.

use std::rc::Rc;

/// A location in user input, attached to every diagnostic.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Place {
    /// No meaningful location (internal origins).
    #[default]
    None,
    /// The command line.
    Argv,
    /// A position in a script or dynamic dependency file.
    Input {
        file: Rc<str>,
        line: u32,
        col: u32,
    },
}

impl Place {
    pub fn input(file: &Rc<str>, line: u32, col: u32) -> Place {
        Place::Input {
            file: file.clone(),
            line,
            col,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Place::None)
    }

    /// The `file:line:col: ` prefix, or a fallback for placeless origins.
    pub fn prefix(&self) -> String {
        match self {
            Place::None => "stu: ".to_string(),
            Place::Argv => "stu: argument: ".to_string(),
            Place::Input { file, line, col } => format!("{}:{}:{}: ", file, line, col),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Syntax,
    Logical,
    Build,
    System,
    Fatal,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::Syntax => "syntax error",
            Kind::Logical => "error",
            Kind::Build => "build error",
            Kind::System => "system error",
            Kind::Fatal => "fatal error",
        }
    }

    /// The bit this kind contributes to the process exit status.
    pub fn exit_bit(self) -> i32 {
        match self {
            Kind::Build | Kind::System => 1,
            Kind::Syntax | Kind::Logical | Kind::Fatal => 2,
        }
    }
}

/// An indented continuation line ("needed by ...", "in ...", "after ...").
#[derive(Clone, Debug)]
pub struct Note {
    pub place: Place,
    pub text: String,
}

/// A user-visible diagnostic with its place and continuation notes.
#[derive(Clone, Debug)]
pub struct Error {
    pub kind: Kind,
    pub place: Place,
    pub text: String,
    pub notes: Vec<Note>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: Kind, place: Place, text: impl Into<String>) -> Error {
        Error {
            kind,
            place,
            text: text.into(),
            notes: Vec::new(),
        }
    }

    pub fn syntax(place: Place, text: impl Into<String>) -> Error {
        Error::new(Kind::Syntax, place, text)
    }

    pub fn logical(place: Place, text: impl Into<String>) -> Error {
        Error::new(Kind::Logical, place, text)
    }

    pub fn build(place: Place, text: impl Into<String>) -> Error {
        Error::new(Kind::Build, place, text)
    }

    pub fn system(place: Place, text: impl Into<String>) -> Error {
        Error::new(Kind::System, place, text)
    }

    pub fn fatal(text: impl Into<String>) -> Error {
        Error::new(Kind::Fatal, Place::None, text)
    }

    pub fn note(mut self, place: Place, text: impl Into<String>) -> Error {
        self.notes.push(Note {
            place,
            text: text.into(),
        });
        self
    }

    /// Render to stderr.  The kind label is colored when stderr is a tty.
    pub fn print(&self, styles: &Styles) {
        eprintln!(
            "{}{}: {}",
            self.place.prefix(),
            styles.error(self.kind.label()),
            self.text
        );
        for note in &self.notes {
            if note.place.is_none() {
                eprintln!("  {}", note.text);
            } else {
                eprintln!("  {}{}", note.place.prefix(), note.text);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}: {}", self.place.prefix(), self.kind.label(), self.text)
    }
}

/// Immutable formatting context: whether to color, and whether names are
/// quoted.  Captured once at startup; quoting is used exactly when color is
/// not available, so names stay distinguishable in piped output.
#[derive(Clone, Copy, Debug)]
pub struct Styles {
    pub color: bool,
}

impl Styles {
    pub fn from_env() -> Styles {
        Styles {
            color: crate::terminal::stderr_is_tty(),
        }
    }

    pub fn plain() -> Styles {
        Styles { color: false }
    }

    fn error(&self, s: &str) -> String {
        if self.color {
            format!("\x1b[31m{}\x1b[0m", s)
        } else {
            s.to_string()
        }
    }

    /// A name as it appears inside a message: bold when colored, quoted
    /// otherwise.
    pub fn word(&self, s: &str) -> String {
        if self.color {
            format!("\x1b[1m{}\x1b[0m", s)
        } else {
            format!("\"{}\"", s)
        }
    }
}
