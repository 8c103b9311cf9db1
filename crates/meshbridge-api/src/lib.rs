// meshbridge-api: Contracts for the collaborators the bridge core drives
// (coordinator, converter registry, classification source).

pub mod classification;
pub mod converter;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod message;

pub use classification::{Classification, ClassificationSource, Component, template_field};
pub use converter::{
    Configure, ConverterRegistry, Decode, DecodeOptions, Decoder, Encode, EncodeMeta, Encoder,
    EventHook, EventKind, MappedDevice, ModelMeta, ReportTrigger, Reporting,
};
pub use coordinator::{Coordinator, CoordinatorEvent, CoordinatorFactory, ResetMode};
pub use device::{Device, DeviceType, Endpoint, Group, Identity, InterviewStatus};
pub use error::Error;
pub use message::{FieldMap, FieldValue, Message};
