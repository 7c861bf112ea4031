pub mod assembly;
pub mod mir;
pub mod smt;
