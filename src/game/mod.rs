pub mod performance;
pub mod player;
pub mod spatial;
pub mod world;
