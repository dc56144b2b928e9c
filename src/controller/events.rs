//! Warning events recorded on MachineHealthChecks
//!
//! Repeats of an event are folded into one Event object. Its name is
//! derived from the MachineHealthCheck, the subject and the reason, and a
//! repeat bumps `count` and `lastTimestamp` of the existing object.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::crd::MachineHealthCheck;
use crate::error::Result;

/// Stable name of the event `reason` about `subject` on `mhc`
pub(crate) fn event_name(mhc: &MachineHealthCheck, subject: Option<&str>, reason: &str) -> String {
    let reason = reason.to_lowercase();
    match subject {
        Some(subject) => format!("{}.{}.{}", mhc.name_any(), subject, reason),
        None => format!("{}.{}", mhc.name_any(), reason),
    }
}

/// First occurrence of a Warning event on `mhc`
pub(crate) fn warning_event(
    mhc: &MachineHealthCheck,
    name: String,
    reason: &str,
    message: &str,
    time: DateTime<Utc>,
) -> Event {
    let namespace = mhc.namespace().unwrap_or_else(|| "default".to_string());

    let obj_ref = ObjectReference {
        api_version: Some(MachineHealthCheck::api_version(&()).to_string()),
        kind: Some(MachineHealthCheck::kind(&()).to_string()),
        name: Some(mhc.name_any()),
        namespace: Some(namespace.clone()),
        uid: mhc.metadata.uid.clone(),
        ..Default::default()
    };

    Event {
        metadata: kube::api::ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            ..Default::default()
        },
        type_: Some("Warning".to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: obj_ref,
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    }
}

/// Record a Warning event on `mhc`, or count a repeat of it
pub(crate) async fn publish_warning(
    client: &Client,
    mhc: &MachineHealthCheck,
    subject: Option<&str>,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = mhc.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);
    let name = event_name(mhc, subject, reason);
    let now = Utc::now();

    match events.get_opt(&name).await? {
        Some(existing) => {
            let count = existing.count.unwrap_or(1).saturating_add(1);
            let patch = json!({
                "count": count,
                "lastTimestamp": Time(now),
                "message": message,
            });
            events
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            debug!("Event {} repeated {} times", name, count);
        }
        None => {
            let event = warning_event(mhc, name, reason, message, now);
            events.create(&PostParams::default(), &event).await?;
        }
    }
    Ok(())
}
