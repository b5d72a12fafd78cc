//! Push validation
//!
//! Turns wire-level deltas into [`ClientDelta`]s. A push with any malformed
//! delta is rejected whole, before a batch exists.

use uuid::Uuid;

use super::error::{SyncError, SyncResult};
use super::types::{
    ClientDelta, ClientDeltaRequest, DeltaOperation, DeltaPayload, DeviceId, EntityKind,
    EntityReference, PushRequest, SyncVersion,
};

/// Bounds applied to incoming pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub max_payload_bytes: usize,
    pub max_batch_deltas: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_batch_deltas: 500,
        }
    }
}

/// Validate a push request
pub fn validate_push(
    request: PushRequest,
    limits: &SyncLimits,
) -> SyncResult<(DeviceId, Vec<ClientDelta>)> {
    let device_id = DeviceId::new(request.device_id)?;

    if request.deltas.is_empty() {
        return Err(SyncError::Validation("batch contains no deltas".to_string()));
    }
    if request.deltas.len() > limits.max_batch_deltas {
        return Err(SyncError::Validation(format!(
            "batch has {} deltas (max: {})",
            request.deltas.len(),
            limits.max_batch_deltas
        )));
    }

    let deltas = request
        .deltas
        .into_iter()
        .enumerate()
        .map(|(index, delta)| {
            validate_delta(delta, limits).map_err(|e| match e {
                SyncError::Validation(msg) => {
                    SyncError::Validation(format!("delta {}: {}", index, msg))
                }
                other => other,
            })
        })
        .collect::<SyncResult<Vec<_>>>()?;

    Ok((device_id, deltas))
}

fn validate_delta(delta: ClientDeltaRequest, limits: &SyncLimits) -> SyncResult<ClientDelta> {
    let entity_kind = EntityKind::new(delta.entity_kind)?;
    let entity_id = Uuid::parse_str(delta.entity_id.trim())
        .map_err(|_| SyncError::Validation(format!("invalid entity id: {}", delta.entity_id)))?;
    let operation: DeltaOperation = delta.operation.trim().parse()?;

    let base_version = u64::try_from(delta.base_version).map_err(|_| {
        SyncError::Validation(format!("negative base version: {}", delta.base_version))
    })?;

    if delta.payload.len() > limits.max_payload_bytes {
        return Err(SyncError::Validation(format!(
            "payload is {} bytes (max: {})",
            delta.payload.len(),
            limits.max_payload_bytes
        )));
    }

    Ok(ClientDelta {
        entity: EntityReference::new(entity_kind, entity_id),
        operation,
        base_version: SyncVersion::new(base_version),
        payload: DeltaPayload::new(delta.payload),
        client_timestamp: delta.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw(operation: &str, base_version: i64, payload: &str) -> ClientDeltaRequest {
        ClientDeltaRequest {
            entity_kind: "project".to_string(),
            entity_id: Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            base_version,
            payload: payload.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn push(deltas: Vec<ClientDeltaRequest>) -> PushRequest {
        PushRequest {
            device_id: "device-a".to_string(),
            deltas,
        }
    }

    #[test]
    fn test_valid_push() {
        let (device, deltas) =
            validate_push(push(vec![raw("create", 0, "{}")]), &SyncLimits::default()).unwrap();
        assert_eq!(device.as_str(), "device-a");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].operation, DeltaOperation::Create);
        assert_eq!(deltas[0].base_version, SyncVersion::INITIAL);
    }

    #[test]
    fn test_rejects_empty_operation() {
        let err = validate_push(push(vec![raw("", 0, "{}")]), &SyncLimits::default()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(ref m) if m.starts_with("delta 0")));
    }

    #[test]
    fn test_rejects_negative_base_version() {
        let err = validate_push(
            push(vec![raw("update", 1, "{}"), raw("update", -1, "{}")]),
            &SyncLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Validation(ref m) if m.starts_with("delta 1")));
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let limits = SyncLimits {
            max_payload_bytes: 8,
            max_batch_deltas: 10,
        };
        let err = validate_push(push(vec![raw("update", 0, r#"{"name":"too long"}"#)]), &limits)
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_rejects_bad_batches() {
        let limits = SyncLimits {
            max_payload_bytes: 1024,
            max_batch_deltas: 1,
        };
        assert!(validate_push(push(vec![]), &limits).is_err());
        assert!(validate_push(push(vec![raw("create", 0, "{}"), raw("create", 0, "{}")]), &limits).is_err());

        let mut blank_device = push(vec![raw("create", 0, "{}")]);
        blank_device.device_id = " ".to_string();
        assert!(validate_push(blank_device, &limits).is_err());

        let mut bad_id = raw("create", 0, "{}");
        bad_id.entity_id = "not-a-uuid".to_string();
        assert!(validate_push(push(vec![bad_id]), &limits).is_err());
    }
}
