//! Server implementations
//!
//! - char: the character hub (map servers, login server link, clients at
//!   character select)

pub mod char;
