//! Typed endpoints and the records they carry.
//!
//! Writes are described by [`Mutation`], validated before they can reach the
//! network or the offline queue. Reference data the client keeps for offline
//! use is named by [`Dataset`] and decodes into the record types below.
//!
//! Related records (a theatre's allocation, an allocation's surgeon) are
//! frequently missing on the server side. Every such link is an `Option` and
//! views fall back to a placeholder instead of assuming presence.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

use super::{ApiRequest, Method};

/// Error type for requests that fail validation before being sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
  #[error("{0} must not be empty")]
  EmptyField(&'static str),

  #[error("quantity must be greater than zero")]
  ZeroQuantity,

  #[error("transfer source and destination are both {0}")]
  SameLocation(String),

  #[error("path must be rooted at '/': {0}")]
  BadPath(String),

  #[error("unknown HTTP method: {0}")]
  UnknownMethod(String),

  #[error("unknown dataset: {0}")]
  UnknownDataset(String),
}

// ============================================================================
// Mutations
// ============================================================================

/// Severity attached to an equipment fault report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultSeverity {
  Low,
  Medium,
  High,
  Critical,
}

/// Lifecycle status of a scheduled surgery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurgeryStatus {
  Scheduled,
  InProgress,
  Completed,
  Cancelled,
  Postponed,
}

/// Every write the client may perform while possibly offline.
///
/// Duty sessions carry a client-generated `session_id` so that an
/// `EndDuty` queued offline can refer to a `StartDuty` the server has not
/// seen yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
  StartDuty {
    session_id: String,
    staff_id: String,
    theatre_id: String,
    #[serde(default)]
    role: Option<String>,
    started_at: DateTime<Utc>,
  },
  EndDuty {
    session_id: String,
    ended_at: DateTime<Utc>,
  },
  LogCleaning {
    theatre_id: String,
    cleaned_by: String,
    cleaning_type: String,
    completed_at: DateTime<Utc>,
    #[serde(default)]
    notes: Option<String>,
  },
  ReportFault {
    equipment_id: String,
    reported_by: String,
    description: String,
    severity: FaultSeverity,
  },
  TransferStock {
    item_id: String,
    from_location: String,
    to_location: String,
    quantity: u32,
    requested_by: String,
  },
  UpdateSurgeryStatus {
    surgery_id: String,
    status: SurgeryStatus,
  },
}

impl Mutation {
  /// Short name used in logs.
  pub fn name(&self) -> &'static str {
    match self {
      Mutation::StartDuty { .. } => "start_duty",
      Mutation::EndDuty { .. } => "end_duty",
      Mutation::LogCleaning { .. } => "log_cleaning",
      Mutation::ReportFault { .. } => "report_fault",
      Mutation::TransferStock { .. } => "transfer_stock",
      Mutation::UpdateSurgeryStatus { .. } => "update_surgery_status",
    }
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    match self {
      Mutation::StartDuty {
        session_id,
        staff_id,
        theatre_id,
        ..
      } => {
        require("session_id", session_id)?;
        require("staff_id", staff_id)?;
        require("theatre_id", theatre_id)
      }
      Mutation::EndDuty { session_id, .. } => require("session_id", session_id),
      Mutation::LogCleaning {
        theatre_id,
        cleaned_by,
        cleaning_type,
        ..
      } => {
        require("theatre_id", theatre_id)?;
        require("cleaned_by", cleaned_by)?;
        require("cleaning_type", cleaning_type)
      }
      Mutation::ReportFault {
        equipment_id,
        reported_by,
        description,
        ..
      } => {
        require("equipment_id", equipment_id)?;
        require("reported_by", reported_by)?;
        require("description", description)
      }
      Mutation::TransferStock {
        item_id,
        from_location,
        to_location,
        quantity,
        requested_by,
      } => {
        require("item_id", item_id)?;
        require("from_location", from_location)?;
        require("to_location", to_location)?;
        require("requested_by", requested_by)?;
        if *quantity == 0 {
          return Err(ValidationError::ZeroQuantity);
        }
        if from_location.trim() == to_location.trim() {
          return Err(ValidationError::SameLocation(from_location.clone()));
        }
        Ok(())
      }
      Mutation::UpdateSurgeryStatus { surgery_id, .. } => require("surgery_id", surgery_id),
    }
  }

  /// Validate and lower into the generic request shape.
  pub fn to_request(&self) -> Result<ApiRequest, ValidationError> {
    self.validate()?;

    let (method, path, body) = match self {
      Mutation::StartDuty {
        session_id,
        staff_id,
        theatre_id,
        role,
        started_at,
      } => (
        Method::Post,
        "/api/duty-logs".to_string(),
        json!({
          "sessionId": session_id,
          "staffId": staff_id,
          "theatreId": theatre_id,
          "role": role,
          "startedAt": started_at,
        }),
      ),
      Mutation::EndDuty {
        session_id,
        ended_at,
      } => (
        Method::Post,
        format!("/api/duty-logs/{}/end", session_id),
        json!({ "endedAt": ended_at }),
      ),
      Mutation::LogCleaning {
        theatre_id,
        cleaned_by,
        cleaning_type,
        completed_at,
        notes,
      } => (
        Method::Post,
        "/api/cleaning-logs".to_string(),
        json!({
          "theatreId": theatre_id,
          "cleanedBy": cleaned_by,
          "cleaningType": cleaning_type,
          "completedAt": completed_at,
          "notes": notes,
        }),
      ),
      Mutation::ReportFault {
        equipment_id,
        reported_by,
        description,
        severity,
      } => (
        Method::Post,
        format!("/api/equipment/{}/faults", equipment_id),
        json!({
          "reportedBy": reported_by,
          "description": description,
          "severity": severity,
        }),
      ),
      Mutation::TransferStock {
        item_id,
        from_location,
        to_location,
        quantity,
        requested_by,
      } => (
        Method::Post,
        "/api/stock-transfers".to_string(),
        json!({
          "itemId": item_id,
          "fromLocation": from_location,
          "toLocation": to_location,
          "quantity": quantity,
          "requestedBy": requested_by,
        }),
      ),
      Mutation::UpdateSurgeryStatus { surgery_id, status } => (
        Method::Patch,
        format!("/api/surgeries/{}", surgery_id),
        json!({ "status": status }),
      ),
    };

    ApiRequest::new(method, path, Some(body))
  }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
  if value.trim().is_empty() {
    Err(ValidationError::EmptyField(field))
  } else {
    Ok(())
  }
}

// ============================================================================
// Datasets
// ============================================================================

/// Reference data kept locally for offline reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dataset {
  Theatres,
  TodayAllocations,
  Staff,
  Equipment,
}

impl Dataset {
  pub const ALL: [Dataset; 4] = [
    Dataset::Theatres,
    Dataset::TodayAllocations,
    Dataset::Staff,
    Dataset::Equipment,
  ];

  /// Cache key, also the name used in configuration.
  pub fn key(&self) -> &'static str {
    match self {
      Dataset::Theatres => "theatres",
      Dataset::TodayAllocations => "today-allocations",
      Dataset::Staff => "staff",
      Dataset::Equipment => "equipment",
    }
  }

  /// API path serving this dataset.
  pub fn path(&self) -> &'static str {
    match self {
      Dataset::Theatres => "/api/theatres",
      Dataset::TodayAllocations => "/api/allocations/today",
      Dataset::Staff => "/api/staff",
      Dataset::Equipment => "/api/equipment",
    }
  }

  /// The dataset served at `path`, ignoring any query string.
  pub fn from_path(path: &str) -> Option<Dataset> {
    let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
    Dataset::ALL.into_iter().find(|d| d.path() == path)
  }

  pub fn request(&self) -> ApiRequest {
    ApiRequest {
      method: Method::Get,
      path: self.path().to_string(),
      body: None,
    }
  }
}

impl fmt::Display for Dataset {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.key())
  }
}

impl FromStr for Dataset {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Dataset::ALL
      .into_iter()
      .find(|d| d.key() == s)
      .ok_or_else(|| ValidationError::UnknownDataset(s.to_string()))
  }
}

/// A record type served as a list by one [`Dataset`].
pub trait DatasetRecord: DeserializeOwned {
  const DATASET: Dataset;
}

// ============================================================================
// Records
// ============================================================================

const UNKNOWN_STAFF: &str = "Unknown staff";
const UNASSIGNED_THEATRE: &str = "Unassigned theatre";

/// Reference to a staff member embedded in another record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffRef {
  pub id: String,
  pub full_name: Option<String>,
  pub role: Option<String>,
}

impl StaffRef {
  pub fn display_name(&self) -> &str {
    self.full_name.as_deref().unwrap_or(UNKNOWN_STAFF)
  }
}

/// Reference to a theatre embedded in another record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TheatreRef {
  pub id: String,
  pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Theatre {
  pub id: String,
  pub name: String,
  pub location: Option<String>,
  pub status: Option<String>,
}

impl DatasetRecord for Theatre {
  const DATASET: Dataset = Dataset::Theatres;
}

/// A theatre session allocated for today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
  pub id: String,
  pub date: NaiveDate,
  pub session: String,
  pub theatre: Option<TheatreRef>,
  pub surgeon: Option<StaffRef>,
  pub anaesthetist: Option<StaffRef>,
  pub specialty: Option<String>,
}

impl Allocation {
  pub fn surgeon_name(&self) -> &str {
    self
      .surgeon
      .as_ref()
      .map(StaffRef::display_name)
      .unwrap_or(UNKNOWN_STAFF)
  }

  pub fn anaesthetist_name(&self) -> &str {
    self
      .anaesthetist
      .as_ref()
      .map(StaffRef::display_name)
      .unwrap_or(UNKNOWN_STAFF)
  }

  pub fn theatre_name(&self) -> &str {
    self
      .theatre
      .as_ref()
      .and_then(|t| t.name.as_deref())
      .unwrap_or(UNASSIGNED_THEATRE)
  }
}

impl DatasetRecord for Allocation {
  const DATASET: Dataset = Dataset::TodayAllocations;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMember {
  pub id: String,
  pub full_name: Option<String>,
  pub role: String,
  pub department: Option<String>,
}

impl StaffMember {
  pub fn display_name(&self) -> &str {
    self.full_name.as_deref().unwrap_or(UNKNOWN_STAFF)
  }
}

impl DatasetRecord for StaffMember {
  const DATASET: Dataset = Dataset::Staff;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentItem {
  pub id: String,
  pub name: String,
  pub serial_number: Option<String>,
  pub status: Option<String>,
  pub theatre: Option<TheatreRef>,
}

impl DatasetRecord for EquipmentItem {
  const DATASET: Dataset = Dataset::Equipment;
}
