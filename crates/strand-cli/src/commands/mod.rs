pub mod check;
pub mod programs;
pub mod run;
