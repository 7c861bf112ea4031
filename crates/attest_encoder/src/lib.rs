pub mod api;
pub mod body;
pub mod boxing;
pub mod emit;
pub mod error;
pub mod faults;
pub mod havoc;
pub mod lists;
pub mod regex;
pub mod safety;

pub use emit::{encode_assembly, EncodeOutput};
pub use error::EncodeError;
