pub mod controlflow;
pub mod fs;
