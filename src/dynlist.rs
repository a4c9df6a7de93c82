//! Parsing of dynamic dependency list files.
//!
//! The content of a built dynamic dependency is read back as a list of
//! further dependencies.  By default it uses stu syntax (quoting, flags and
//! nested brackets allowed); with `-n`/`-0` semantics it is a raw list of
//! newline- or NUL-separated filenames without any markup.

use crate::dep::{Dep, DirectDep};
use crate::error::{Place, Result, Styles};
use crate::name::{ParamName, ParamTarget, TargetKind};
use crate::parse;
use crate::tokenize;
use std::rc::Rc;

/// How the content of a dynamic dependency file is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Separator {
    Stu,
    Newline,
    Nul,
}

/// Parse the content of the file `filename` into a dependency list.
pub fn parse(
    content: &[u8],
    filename: &str,
    sep: Separator,
    styles: &Styles,
) -> Result<Vec<Rc<Dep>>> {
    match sep {
        Separator::Stu => {
            let file: Rc<str> = filename.into();
            let (tokens, place_end) = tokenize::tokenize(content, &file)?;
            parse::parse_dynamic_list(&tokens, &place_end, styles)
        }
        Separator::Newline => Ok(split_names(content, b'\n', filename)),
        Separator::Nul => Ok(split_names(content, b'\0', filename)),
    }
}

fn split_names(content: &[u8], sep: u8, filename: &str) -> Vec<Rc<Dep>> {
    let file: Rc<str> = filename.into();
    let mut ret = Vec::new();
    for (i, piece) in content.split(|&c| c == sep).enumerate() {
        let piece = if sep == b'\n' && piece.ends_with(b"\r") {
            &piece[..piece.len() - 1]
        } else {
            piece
        };
        if piece.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(piece).into_owned();
        let place = Place::input(&file, (i + 1) as u32, 1);
        ret.push(Rc::new(Dep::Direct(DirectDep::new(
            0,
            ParamTarget {
                kind: TargetKind::File,
                name: ParamName::plain(name),
                place,
            },
        ))));
    }
    ret
}
