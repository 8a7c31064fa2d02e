pub mod calibrator;
pub mod estimator;
pub mod fusion;
pub mod model;
pub mod playspace;
pub mod refine;
pub mod smooth;

pub use calibrator::{CalibrationError, CalibrationReport, MarkerProgress, MarkerStatus, TrackerCalibrator};
pub use estimator::{EstimateError, PoseEstimate, PoseEstimator};
pub use fusion::{AlignmentError, AlignmentTable, CameraAlignment, CameraObservation, MultiCameraFuser};
pub use model::{CalibrationState, MarkerOffset, ModelError, RigidBodyModel};
pub use playspace::Playspace;
pub use refine::{refine_model, FrameObservation, RefineReport};
pub use smooth::{Stale, TemporalSmoother};
