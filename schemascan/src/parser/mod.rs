//! S-expression handling and KiCad schematic re-import.

pub mod kicad;
pub mod sexp;

pub use kicad::{ImportedLabel, ImportedSchematic, ImportedSymbol, KicadReader, NETS_PROPERTY};
pub use sexp::{ParseError, SExp, SExpParser};
