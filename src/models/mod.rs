pub mod detection;
pub mod enums;
pub mod user;

pub use detection::*;
pub use enums::*;
pub use user::*;
