pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod generate;
pub mod paths;
pub mod privacy;
pub mod runner;
pub mod sink;
pub mod store;
pub mod table;
pub mod tasks;
pub mod util;
pub mod warn;
pub mod window;
