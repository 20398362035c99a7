pub mod event;
pub mod run;
pub mod thread;
pub mod tool;
