//! Process-level infrastructure shared by the keeper components.

pub mod logging;
