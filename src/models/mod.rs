pub mod frame;
pub mod inference;

pub use frame::{CapturedFrame, FrameEnvelope, FramePayload};
pub use inference::{
    BoundingBox, CorrelatedResult, FaceGeometry, InferenceResult, RawClassification,
};
