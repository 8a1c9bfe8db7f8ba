pub mod cli;
pub mod privileges;
pub mod supervisor;
pub mod worker;
