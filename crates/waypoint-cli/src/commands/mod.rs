pub mod dead_letters;
pub mod demo;
pub mod reset;
pub mod status;
