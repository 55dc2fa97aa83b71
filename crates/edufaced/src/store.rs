//! Student registry and daily attendance, kept in SQLite.
//!
//! Queries are plain functions over a `rusqlite::Connection`; [`Store`] runs
//! them on the tokio-rusqlite background thread.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS students (
    id                INTEGER PRIMARY KEY,
    code              TEXT NOT NULL UNIQUE,
    name              TEXT NOT NULL,
    grade             TEXT,
    section           TEXT,
    gender            TEXT,
    registration_date TEXT,
    photo_path        TEXT
);

CREATE TABLE IF NOT EXISTS attendances (
    id         INTEGER PRIMARY KEY,
    student_id INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
    date       TEXT NOT NULL,
    marked_at  TEXT NOT NULL,
    status     TEXT NOT NULL,
    UNIQUE (student_id, date)
);

CREATE INDEX IF NOT EXISTS idx_attendances_marked_at ON attendances(marked_at);
";

const STUDENT_COLUMNS: &str = "id, code, name, grade, section, gender, registration_date, photo_path";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attendance database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("student code '{0}' already exists")]
    DuplicateCode(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub grade: Option<String>,
    pub section: Option<String>,
    pub gender: Option<String>,
    pub registration_date: Option<NaiveDate>,
    pub photo_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    pub code: String,
    pub name: String,
    pub grade: Option<String>,
    pub section: Option<String>,
    pub gender: Option<String>,
    pub registration_date: Option<NaiveDate>,
    pub photo_path: Option<String>,
}

impl NewStudent {
    /// A student known only by the reference folder it was recognised from.
    fn from_code(code: &str) -> Self {
        Self {
            code: code.to_string(),
            name: code.to_string(),
            grade: None,
            section: None,
            gender: None,
            registration_date: None,
            photo_path: None,
        }
    }
}

/// Partial update: absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentUpdate {
    pub name: Option<String>,
    pub grade: Option<String>,
    pub section: Option<String>,
    pub gender: Option<String>,
    pub registration_date: Option<NaiveDate>,
    pub photo_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentFilter {
    pub grade: Option<String>,
    pub section: Option<String>,
    /// Substring of the name or the code.
    pub q: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[serde(rename = "Puntual")]
    OnTime,
    #[serde(rename = "Tarde")]
    Late,
}

impl AttendanceStatus {
    /// Strictly after `late_after` is late.
    pub fn at(time: NaiveTime, late_after: NaiveTime) -> Self {
        if time > late_after {
            Self::Late
        } else {
            Self::OnTime
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::OnTime => "Puntual",
            Self::Late => "Tarde",
        }
    }
}

impl ToSql for AttendanceStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AttendanceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "Puntual" => Ok(Self::OnTime),
            "Tarde" => Ok(Self::Late),
            other => Err(FromSqlError::Other(format!("unknown attendance status '{other}'").into())),
        }
    }
}

/// One student's attendance on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attendance {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

/// An attendance row joined with its student, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub student_id: i64,
    pub code: String,
    pub name: String,
    pub grade: Option<String>,
    pub section: Option<String>,
    pub gender: Option<String>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkOutcome {
    pub student: Student,
    pub attendance: Attendance,
    /// False when the student was already marked that day.
    pub first_today: bool,
}

/// Codes name reference folders, so they must be a single plain path component.
pub fn validate_code(code: &str) -> Result<(), StoreError> {
    let plain = !code.is_empty()
        && !code.starts_with('.')
        && !code.contains(['/', '\\'])
        && !code.chars().any(char::is_control);
    if plain {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("invalid student code '{code}'")))
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Invalid("student name must not be empty".to_string()));
    }
    Ok(())
}

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        grade: row.get(3)?,
        section: row.get(4)?,
        gender: row.get(5)?,
        registration_date: row.get(6)?,
        photo_path: row.get(7)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceEntry> {
    let marked_at: NaiveDateTime = row.get(7)?;
    Ok(AttendanceEntry {
        student_id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        grade: row.get(3)?,
        section: row.get(4)?,
        gender: row.get(5)?,
        date: row.get(6)?,
        time: marked_at.time(),
        status: row.get(8)?,
    })
}

pub fn get_student(conn: &Connection, id: i64) -> rusqlite::Result<Option<Student>> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
        params![id],
        student_from_row,
    )
    .optional()
}

fn student_by_code(conn: &Connection, code: &str) -> rusqlite::Result<Option<Student>> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE code = ?1"),
        params![code],
        student_from_row,
    )
    .optional()
}

/// Insert a student; `None` when the code is taken.
pub fn insert_student(conn: &Connection, new: &NewStudent) -> rusqlite::Result<Option<Student>> {
    if student_by_code(conn, &new.code)?.is_some() {
        return Ok(None);
    }
    conn.execute(
        "INSERT INTO students (code, name, grade, section, gender, registration_date, photo_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![new.code, new.name, new.grade, new.section, new.gender, new.registration_date, new.photo_path],
    )?;
    get_student(conn, conn.last_insert_rowid())
}

pub fn list_students(conn: &Connection, filter: &StudentFilter) -> rusqlite::Result<Vec<Student>> {
    let like = filter.q.as_ref().map(|q| format!("%{q}%"));
    let mut stmt = conn.prepare(&format!(
        "SELECT {STUDENT_COLUMNS} FROM students
         WHERE (?1 IS NULL OR grade = ?1)
           AND (?2 IS NULL OR section = ?2)
           AND (?3 IS NULL OR name LIKE ?3 OR code LIKE ?3)
         ORDER BY name, id"
    ))?;
    let rows = stmt.query_map(params![filter.grade, filter.section, like], student_from_row)?;
    rows.collect()
}

pub fn update_student(conn: &Connection, id: i64, update: &StudentUpdate) -> rusqlite::Result<Option<Student>> {
    let changed = conn.execute(
        "UPDATE students SET
             name = COALESCE(?2, name),
             grade = COALESCE(?3, grade),
             section = COALESCE(?4, section),
             gender = COALESCE(?5, gender),
             registration_date = COALESCE(?6, registration_date),
             photo_path = COALESCE(?7, photo_path)
         WHERE id = ?1",
        params![
            id,
            update.name,
            update.grade,
            update.section,
            update.gender,
            update.registration_date,
            update.photo_path
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    get_student(conn, id)
}

/// Delete a student and their attendance; returns the removed row.
pub fn delete_student(conn: &mut Connection, id: i64) -> rusqlite::Result<Option<Student>> {
    let tx = conn.transaction()?;
    let Some(student) = get_student(&tx, id)? else {
        return Ok(None);
    };
    tx.execute("DELETE FROM attendances WHERE student_id = ?1", params![id])?;
    tx.execute("DELETE FROM students WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(Some(student))
}

/// Record `code` as present at `now`, creating the student if needed.
///
/// A student is marked at most once per day; later calls return the first mark.
pub fn mark_attendance(
    conn: &mut Connection,
    code: &str,
    now: NaiveDateTime,
    late_after: NaiveTime,
) -> rusqlite::Result<MarkOutcome> {
    let now = now.with_nanosecond(0).unwrap_or(now);
    let date = now.date();

    let tx = conn.transaction()?;
    let student = match student_by_code(&tx, code)? {
        Some(student) => student,
        None => {
            tracing::info!(code, "registering student seen in reference database");
            insert_student(&tx, &NewStudent::from_code(code))?.ok_or(rusqlite::Error::QueryReturnedNoRows)?
        }
    };

    let inserted = tx.execute(
        "INSERT OR IGNORE INTO attendances (student_id, date, marked_at, status) VALUES (?1, ?2, ?3, ?4)",
        params![student.id, date, now, AttendanceStatus::at(now.time(), late_after)],
    )?;
    let attendance = tx.query_row(
        "SELECT date, marked_at, status FROM attendances WHERE student_id = ?1 AND date = ?2",
        params![student.id, date],
        |row| {
            let marked_at: NaiveDateTime = row.get(1)?;
            Ok(Attendance { date: row.get(0)?, time: marked_at.time(), status: row.get(2)? })
        },
    )?;
    tx.commit()?;

    Ok(MarkOutcome { student, attendance, first_today: inserted == 1 })
}

pub fn attendance_on(conn: &Connection, date: NaiveDate) -> rusqlite::Result<Vec<AttendanceEntry>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.code, s.name, s.grade, s.section, s.gender, a.date, a.marked_at, a.status
         FROM attendances a JOIN students s ON s.id = a.student_id
         WHERE a.date = ?1
         ORDER BY a.marked_at DESC, a.id DESC",
    )?;
    let rows = stmt.query_map(params![date], entry_from_row)?;
    rows.collect()
}

pub fn recent_attendance(conn: &Connection, limit: u32) -> rusqlite::Result<Vec<AttendanceEntry>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.code, s.name, s.grade, s.section, s.gender, a.date, a.marked_at, a.status
         FROM attendances a JOIN students s ON s.id = a.student_id
         ORDER BY a.marked_at DESC, a.id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], entry_from_row)?;
    rows.collect()
}

pub fn student_attendance(conn: &Connection, id: i64, limit: u32) -> rusqlite::Result<Vec<Attendance>> {
    let mut stmt = conn.prepare(
        "SELECT date, marked_at, status FROM attendances
         WHERE student_id = ?1
         ORDER BY marked_at DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![id, limit], |row| {
        let marked_at: NaiveDateTime = row.get(1)?;
        Ok(Attendance { date: row.get(0)?, time: marked_at.time(), status: row.get(2)? })
    })?;
    rows.collect()
}

/// Clone-safe handle to the attendance database.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| Ok(migrate(conn)?)).await?;
        Ok(Self { conn })
    }

    pub async fn create_student(&self, new: NewStudent) -> Result<Student, StoreError> {
        validate_code(&new.code)?;
        validate_name(&new.name)?;
        let code = new.code.clone();
        self.conn
            .call(move |conn| Ok(insert_student(conn, &new)?))
            .await?
            .ok_or(StoreError::DuplicateCode(code))
    }

    pub async fn student(&self, id: i64) -> Result<Option<Student>, StoreError> {
        Ok(self.conn.call(move |conn| Ok(get_student(conn, id)?)).await?)
    }

    pub async fn students(&self, filter: StudentFilter) -> Result<Vec<Student>, StoreError> {
        Ok(self.conn.call(move |conn| Ok(list_students(conn, &filter)?)).await?)
    }

    pub async fn update_student(&self, id: i64, update: StudentUpdate) -> Result<Option<Student>, StoreError> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        Ok(self.conn.call(move |conn| Ok(update_student(conn, id, &update)?)).await?)
    }

    pub async fn delete_student(&self, id: i64) -> Result<Option<Student>, StoreError> {
        Ok(self.conn.call(move |conn| Ok(delete_student(conn, id)?)).await?)
    }

    pub async fn mark(&self, code: String, now: NaiveDateTime, late_after: NaiveTime) -> Result<MarkOutcome, StoreError> {
        validate_code(&code)?;
        Ok(self
            .conn
            .call(move |conn| Ok(mark_attendance(conn, &code, now, late_after)?))
            .await?)
    }

    pub async fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEntry>, StoreError> {
        Ok(self.conn.call(move |conn| Ok(attendance_on(conn, date)?)).await?)
    }

    pub async fn recent_attendance(&self, limit: u32) -> Result<Vec<AttendanceEntry>, StoreError> {
        Ok(self.conn.call(move |conn| Ok(recent_attendance(conn, limit)?)).await?)
    }

    pub async fn student_attendance(&self, id: i64, limit: u32) -> Result<Vec<Attendance>, StoreError> {
        Ok(self.conn.call(move |conn| Ok(student_attendance(conn, id, limit)?)).await?)
    }
}
