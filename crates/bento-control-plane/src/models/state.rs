//! Build and upload status axes of a bento version.
//!
//! Both axes share the same shape: `pending -> in-progress -> {success, failed}`.
//! A state may move forward (skipping the in-progress step is allowed) or be
//! re-asserted; terminal states never change to anything else.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{Error, Result};
use super::BentoVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus { Pending, Building, Success, Failed }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus { Pending, Uploading, Success, Failed }

macro_rules! status_axis {
    ($ty:ident, $axis:literal, $active:ident, $active_str:literal) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self { Self::Pending => "pending", Self::$active => $active_str, Self::Success => "success", Self::Failed => "failed" }
            }

            pub fn is_terminal(self) -> bool { matches!(self, Self::Success | Self::Failed) }

            fn rank(self) -> u8 {
                match self { Self::Pending => 0, Self::$active => 1, Self::Success | Self::Failed => 2 }
            }

            pub fn can_transition_to(self, next: Self) -> bool {
                if self == next { return true; }
                !self.is_terminal() && next.rank() > self.rank()
            }

            pub fn check_transition(self, next: Self) -> Result<()> {
                if self.can_transition_to(next) { Ok(()) }
                else { Err(Error::InvalidTransition { axis: $axis, from: self.as_str(), to: next.as_str() }) }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
        }

        impl std::str::FromStr for $ty {
            type Err = String;
            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    "pending" => Ok(Self::Pending),
                    $active_str => Ok(Self::$active),
                    "success" => Ok(Self::Success),
                    "failed" => Ok(Self::Failed),
                    other => Err(format!("unknown {} status {other:?}", $axis)),
                }
            }
        }

        impl TryFrom<String> for $ty {
            type Error = String;
            fn try_from(s: String) -> std::result::Result<Self, Self::Error> { s.parse() }
        }
    };
}

status_axis!(BuildStatus, "build", Building, "building");
status_axis!(UploadStatus, "upload", Uploading, "uploading");

/// Sparse set of field changes for one `update` call. `None` leaves a field alone.
///
/// The nullable timestamps use a nested option so a caller can clear them
/// (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, ToSchema)]
pub struct BentoVersionChanges {
    #[serde(default)]
    pub build_status: Option<BuildStatus>,
    #[serde(default)]
    pub upload_status: Option<UploadStatus>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub upload_started_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub upload_finished_at: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub upload_finished_reason: Option<String>,
}

// Distinguishes an explicit `null` (clear) from an absent key (leave alone).
fn nullable<'de, D, T>(de: D) -> std::result::Result<Option<Option<T>>, D::Error>
where D: serde::Deserializer<'de>, T: Deserialize<'de> {
    Option::<T>::deserialize(de).map(Some)
}

impl BentoVersionChanges {
    pub fn is_empty(&self) -> bool {
        self.build_status.is_none() && self.upload_status.is_none() && self.upload_started_at.is_none()
            && self.upload_finished_at.is_none() && self.upload_finished_reason.is_none()
    }

    /// True when this change set moves the upload into `success`; this is the build trigger.
    pub fn completes_upload(&self) -> bool { self.upload_status == Some(UploadStatus::Success) }

    pub fn validate(&self, current: &BentoVersion) -> Result<()> {
        if let Some(next) = self.build_status { current.build_status.check_transition(next)?; }
        if let Some(next) = self.upload_status { current.upload_status.check_transition(next)?; }
        Ok(())
    }

    /// Mirror the changes into an in-memory record. Call only after the write committed.
    pub fn apply_to(&self, version: &mut BentoVersion) {
        if let Some(s) = self.build_status { version.build_status = s; }
        if let Some(s) = self.upload_status { version.upload_status = s; }
        if let Some(t) = self.upload_started_at { version.upload_started_at = t; }
        if let Some(t) = self.upload_finished_at { version.upload_finished_at = t; }
        if let Some(r) = &self.upload_finished_reason { version.upload_finished_reason = Some(r.clone()); }
    }
}
