mod key;
pub use key::*;

mod code;
pub use code::*;
