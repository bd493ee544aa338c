mod doc;
mod editor;
mod extensions;
mod html;
mod ops;
mod registry;

pub use crate::doc::*;
pub use crate::editor::*;
pub use crate::extensions::{IMAGE_ALIGNMENTS, MAX_FONT_SIZE_PT, MIN_FONT_SIZE_PT};
pub use crate::html::{parse, serialize};
pub use crate::ops::*;
pub use crate::registry::*;
