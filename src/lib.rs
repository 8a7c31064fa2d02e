pub mod calibration;
pub mod camera;
pub mod config;
pub mod geometry;
pub mod logging;
pub mod marker;
pub mod session;
pub mod sim;
pub mod solver;
pub mod tracker;
pub mod vmt;
