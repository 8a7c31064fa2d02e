mod calibration;
mod capture;
#[cfg(feature = "camera")]
pub mod charuco;
mod intrinsics;

pub use calibration::{
    intrinsics_snippet, load_intrinsics, resolve_intrinsics, save_intrinsics, worst_view,
    IntrinsicsCalibration, IntrinsicsFile,
};
pub use capture::{Frame, FrameSlot, FrameSource, ThreadedCamera};
#[cfg(feature = "camera")]
pub use capture::OpenCvCamera;
pub use intrinsics::CameraIntrinsics;
