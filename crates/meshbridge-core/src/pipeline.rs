// ── Message conversion pipeline ──
//
// Filter raw coordinator messages, then run the model's decoders over the
// ones that survive. Filtering happens in the supervisor so that dropped
// traffic never reaches the registry and never feeds the idle watchdog.

use std::sync::Arc;

use meshbridge_api::{ConverterRegistry, DecodeOptions, DeviceType, FieldMap, FieldValue, Identity, MappedDevice, Message};
use tracing::{debug, warn};

/// Outcome of the admission filter for one message.
#[derive(Debug, Clone)]
pub enum Admission {
    Admit(Arc<MappedDevice>),
    /// Sent by the coordinator itself.
    FromCoordinator,
    /// A Xiaomi router relaying an end device's report.
    Retransmission,
    /// Model unknown and the interview is still running.
    Interviewing,
    /// No converter entry for this model.
    Unsupported,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit(_))
    }
}

/// Decide whether `message` should be processed at all. Checks run in a
/// fixed order and the first failing one wins.
pub fn admit(message: &Message, coordinator: Option<&Identity>, converters: &dyn ConverterRegistry) -> Admission {
    let device = &message.device;

    if coordinator == Some(&device.identity) {
        debug!("ignoring message from coordinator");
        return Admission::FromCoordinator;
    }

    if device.is_xiaomi() && device.device_type == DeviceType::Router && message.group_id != 0 {
        debug!(identity = %device.identity, group_id = message.group_id, "skipping re-transmitted Xiaomi message");
        return Admission::Retransmission;
    }

    if device.model_id.is_none() && device.interviewing {
        debug!(identity = %device.identity, "skipping message, model unknown and still interviewing");
        return Admission::Interviewing;
    }

    match converters.find_by_device(device) {
        Some(mapped) => Admission::Admit(mapped),
        None => {
            warn!(
                identity = %device.identity,
                model = device.model_id.as_deref().unwrap_or("<unknown>"),
                "received message from unsupported device"
            );
            Admission::Unsupported
        }
    }
}

/// Run every decoder matching the message's cluster and type, in
/// registration order. Later decoders overwrite earlier fields.
pub fn convert(mapped: &MappedDevice, message: &Message, options: &DecodeOptions) -> FieldMap {
    let mut converted = FieldMap::new();
    for decoder in mapped.decoders_for(&message.cluster, &message.kind) {
        match decoder.decode(message, options) {
            Ok(fields) => converted.extend(fields),
            Err(e) => warn!(
                identity = %message.device.identity,
                cluster = %message.cluster,
                kind = %message.kind,
                error = %e,
                "decoder failed, skipping"
            ),
        }
    }
    if let Some(linkquality) = message.linkquality {
        converted.insert("linkquality".into(), FieldValue::Number(f64::from(linkquality)));
    }
    converted
}
