pub mod bulletins;
pub mod certificates;
pub mod core;
pub mod scores;
pub mod settings;
pub mod setup;
pub mod terms;
