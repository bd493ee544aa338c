mod debounce;
mod options;
mod session;
mod sync;
mod url_rewrite;

pub use crate::debounce::*;
pub use crate::options::*;
pub use crate::session::*;
pub use crate::sync::*;
pub use crate::url_rewrite::*;
