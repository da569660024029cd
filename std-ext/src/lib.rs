//! Small monkey patches of `std` types, broken out of `link-task` so they can
//! be reused without pulling in the task machinery.

pub mod result;

pub type Void = std::convert::Infallible;

pub mod prelude {
    use super::*;

    pub use super::Void;
    pub use result::ResultExt;
}
