pub mod dispatcher;
pub mod progress;
pub mod runner;
pub mod status;
pub mod vcs;
