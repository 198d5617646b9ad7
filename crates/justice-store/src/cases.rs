//! Case records and their ordered participant seats.
//!
//! `CaseRepo` is the reference implementation of the `CaseDirectory`
//! contract: every registered participant of a case is authorized to join
//! its rooms.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub use justice_core::collab::CaseMode;
use justice_core::collab::{CaseAccess, CaseDirectory, Seat};
use justice_core::errors::DirectoryError;
use justice_core::ids::{CaseId, ParticipantId};
use justice_core::turns::PartyKind;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Open,
    Closed,
    Published,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Published => "published",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "published" => Ok(Self::Published),
            other => Err(format!("unknown case status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseRow {
    pub id: CaseId,
    pub title: String,
    pub description: String,
    pub mode: CaseMode,
    pub status: CaseStatus,
    pub participants: Vec<Seat>,
    pub created_at: String,
    pub updated_at: String,
}

impl CaseRow {
    pub fn access(&self) -> CaseAccess {
        CaseAccess {
            case_id: self.id.clone(),
            mode: self.mode,
            seats: self.participants.clone(),
        }
    }
}

/// Parameters for creating a case.
#[derive(Clone, Debug, Deserialize)]
pub struct NewCase {
    pub title: String,
    pub description: String,
    pub mode: CaseMode,
    pub owner: ParticipantId,
}

pub struct CaseRepo {
    db: Database,
}

impl CaseRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a case with its owner in the first seat.
    #[instrument(skip(self, new), fields(owner = %new.owner, mode = %new.mode))]
    pub fn create(&self, new: &NewCase) -> Result<CaseRow, StoreError> {
        if new.title.trim().is_empty() {
            return Err(StoreError::Conflict("case title must not be empty".into()));
        }
        let id = CaseId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cases (id, title, description, mode, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    id.as_str(),
                    new.title,
                    new.description,
                    new.mode.as_str(),
                    CaseStatus::Open.as_str(),
                    now,
                ],
            )?;
            conn.execute(
                "INSERT INTO case_participants (case_id, seat, address, kind, joined_at)
                 VALUES (?1, 0, ?2, ?3, ?4)",
                rusqlite::params![
                    id.as_str(),
                    new.owner.as_str(),
                    PartyKind::Human.as_str(),
                    now
                ],
            )?;
            Ok(())
        })?;

        self.get(&id)
    }

    #[instrument(skip(self), fields(case_id = %id))]
    pub fn get(&self, id: &CaseId) -> Result<CaseRow, StoreError> {
        self.db.with_conn(|conn| load_case(conn, id))
    }

    /// List all cases, newest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<CaseRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, description, mode, status, created_at, updated_at
                 FROM cases ORDER BY created_at DESC, id DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut cases = Vec::new();
            while let Some(row) = rows.next()? {
                cases.push(row_to_case(row)?);
            }
            for case in &mut cases {
                case.participants = load_seats(conn, &case.id)?;
            }
            Ok(cases)
        })
    }

    /// Seat a second human participant. Re-adding a seated address is a no-op.
    ///
    /// The seat check and the insert run under one connection lock, so two
    /// racing joiners cannot both claim the second seat.
    #[instrument(skip(self), fields(case_id = %id, address = %address))]
    pub fn add_participant(
        &self,
        id: &CaseId,
        address: &ParticipantId,
    ) -> Result<CaseRow, StoreError> {
        self.db.with_conn(|conn| {
            let case = load_case(conn, id)?;
            if case.participants.iter().any(|s| &s.address == address) {
                return Ok(case);
            }
            if case.mode == CaseMode::HumanAi {
                return Err(StoreError::Conflict(format!(
                    "case {id} is argued against an automated opponent"
                )));
            }
            if case.participants.len() >= 2 {
                return Err(StoreError::Conflict(format!(
                    "case {id} already has two participants"
                )));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO case_participants (case_id, seat, address, kind, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    case.participants.len() as i64,
                    address.as_str(),
                    PartyKind::Human.as_str(),
                    now
                ],
            )?;
            conn.execute(
                "UPDATE cases SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            load_case(conn, id)
        })
    }

    #[instrument(skip(self), fields(case_id = %id, status = %status))]
    pub fn update_status(&self, id: &CaseId, status: CaseStatus) -> Result<CaseRow, StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE cases SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), Utc::now().to_rfc3339(), id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("case {id}")));
        }
        self.get(id)
    }
}

#[async_trait]
impl CaseDirectory for CaseRepo {
    async fn lookup(&self, case_id: &CaseId) -> Result<Option<CaseAccess>, DirectoryError> {
        match self.get(case_id) {
            Ok(case) => Ok(Some(case.access())),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn load_case(conn: &rusqlite::Connection, id: &CaseId) -> Result<CaseRow, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, description, mode, status, created_at, updated_at
         FROM cases WHERE id = ?1",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut case = match rows.next()? {
        Some(row) => row_to_case(row)?,
        None => return Err(StoreError::NotFound(format!("case {id}"))),
    };
    case.participants = load_seats(conn, id)?;
    Ok(case)
}

fn row_to_case(row: &rusqlite::Row<'_>) -> Result<CaseRow, StoreError> {
    let mode: String = row_helpers::get(row, 3, "cases", "mode")?;
    let status: String = row_helpers::get(row, 4, "cases", "status")?;
    Ok(CaseRow {
        id: CaseId::from_raw(row_helpers::get::<String>(row, 0, "cases", "id")?),
        title: row_helpers::get(row, 1, "cases", "title")?,
        description: row_helpers::get(row, 2, "cases", "description")?,
        mode: row_helpers::parse_enum(&mode, "cases", "mode")?,
        status: row_helpers::parse_enum(&status, "cases", "status")?,
        participants: Vec::new(),
        created_at: row_helpers::get(row, 5, "cases", "created_at")?,
        updated_at: row_helpers::get(row, 6, "cases", "updated_at")?,
    })
}

fn load_seats(conn: &rusqlite::Connection, id: &CaseId) -> Result<Vec<Seat>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT address, kind FROM case_participants WHERE case_id = ?1 ORDER BY seat ASC",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut seats = Vec::new();
    while let Some(row) = rows.next()? {
        let kind: String = row_helpers::get(row, 1, "case_participants", "kind")?;
        seats.push(Seat {
            address: ParticipantId::from_raw(row_helpers::get::<String>(
                row,
                0,
                "case_participants",
                "address",
            )?),
            kind: row_helpers::parse_enum(&kind, "case_participants", "kind")?,
        });
    }
    Ok(seats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> CaseRepo {
        CaseRepo::new(Database::in_memory().unwrap())
    }

    fn new_case(mode: CaseMode) -> NewCase {
        NewCase {
            title: "Contract dispute".into(),
            description: "Late delivery of goods".into(),
            mode,
            owner: ParticipantId::from_raw("0xaaa"),
        }
    }

    #[test]
    fn create_seats_owner_first() {
        let repo = repo();
        let case = repo.create(&new_case(CaseMode::HumanHuman)).unwrap();
        assert!(case.id.as_str().starts_with("case_"));
        assert_eq!(case.status, CaseStatus::Open);
        assert_eq!(case.participants.len(), 1);
        assert_eq!(case.participants[0].address.as_str(), "0xaaa");
        assert_eq!(case.participants[0].kind, PartyKind::Human);
    }

    #[test]
    fn create_rejects_blank_title() {
        let repo = repo();
        let mut new = new_case(CaseMode::HumanHuman);
        new.title = "  ".into();
        assert!(matches!(repo.create(&new), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn get_missing_case_is_not_found() {
        let repo = repo();
        let result = repo.get(&CaseId::from_raw("case_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn add_participant_fills_second_seat() {
        let repo = repo();
        let case = repo.create(&new_case(CaseMode::HumanHuman)).unwrap();
        let updated = repo
            .add_participant(&case.id, &ParticipantId::from_raw("0xbbb"))
            .unwrap();
        assert_eq!(updated.participants.len(), 2);
        assert_eq!(updated.participants[1].address.as_str(), "0xbbb");
    }

    #[test]
    fn add_participant_is_idempotent_for_seated_address() {
        let repo = repo();
        let case = repo.create(&new_case(CaseMode::HumanHuman)).unwrap();
        let bbb = ParticipantId::from_raw("0xbbb");
        repo.add_participant(&case.id, &bbb).unwrap();
        let again = repo.add_participant(&case.id, &bbb).unwrap();
        assert_eq!(again.participants.len(), 2);
        let owner_again = repo
            .add_participant(&case.id, &ParticipantId::from_raw("0xaaa"))
            .unwrap();
        assert_eq!(owner_again.participants.len(), 2);
    }

    #[test]
    fn add_participant_rejects_third_address() {
        let repo = repo();
        let case = repo.create(&new_case(CaseMode::HumanHuman)).unwrap();
        repo.add_participant(&case.id, &ParticipantId::from_raw("0xbbb"))
            .unwrap();
        let result = repo.add_participant(&case.id, &ParticipantId::from_raw("0xccc"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn racing_joiners_get_one_seat_and_conflicts() {
        let repo = std::sync::Arc::new(repo());
        let case = repo.create(&new_case(CaseMode::HumanHuman)).unwrap();

        let joiners: Vec<_> = (0..8)
            .map(|i| {
                let repo = repo.clone();
                let id = case.id.clone();
                std::thread::spawn(move || {
                    repo.add_participant(&id, &ParticipantId::from_raw(format!("0x{i:03}")))
                })
            })
            .collect();
        let results: Vec<_> = joiners.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, StoreError::Conflict(_))));
        assert_eq!(repo.get(&case.id).unwrap().participants.len(), 2);
    }

    #[test]
    fn add_participant_rejected_for_human_ai_case() {
        let repo = repo();
        let case = repo.create(&new_case(CaseMode::HumanAi)).unwrap();
        let result = repo.add_participant(&case.id, &ParticipantId::from_raw("0xbbb"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn update_status_persists() {
        let repo = repo();
        let case = repo.create(&new_case(CaseMode::HumanHuman)).unwrap();
        let updated = repo.update_status(&case.id, CaseStatus::Published).unwrap();
        assert_eq!(updated.status, CaseStatus::Published);
        assert_eq!(repo.get(&case.id).unwrap().status, CaseStatus::Published);
    }

    #[test]
    fn update_status_missing_case() {
        let repo = repo();
        let result = repo.update_status(&CaseId::from_raw("nope"), CaseStatus::Closed);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_returns_all_cases() {
        let repo = repo();
        repo.create(&new_case(CaseMode::HumanHuman)).unwrap();
        repo.create(&new_case(CaseMode::HumanAi)).unwrap();
        let all = repo.list().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.participants.len() == 1));
    }

    #[tokio::test]
    async fn lookup_authorizes_every_participant() {
        let repo = repo();
        let case = repo.create(&new_case(CaseMode::HumanHuman)).unwrap();
        repo.add_participant(&case.id, &ParticipantId::from_raw("0xbbb"))
            .unwrap();

        let access = repo.lookup(&case.id).await.unwrap().unwrap();
        assert_eq!(access.mode, CaseMode::HumanHuman);
        assert!(access.is_authorized(&ParticipantId::from_raw("0xaaa")));
        assert!(access.is_authorized(&ParticipantId::from_raw("0xbbb")));
        assert!(!access.is_authorized(&ParticipantId::from_raw("0xccc")));
    }

    #[tokio::test]
    async fn lookup_missing_case_is_none() {
        let repo = repo();
        assert!(repo.lookup(&CaseId::from_raw("nope")).await.unwrap().is_none());
    }
}
