//! Analyzer query jobs: ask a TCP analyzer for its field catalogue over LIS2-A2.
//!
//! A query runs as a background task. [`QueryService::start_query`] returns a job id at once and
//! the caller polls [`QueryService::status`]. Jobs move `pending -> in_progress` and end in one
//! of `completed`, `failed` or `cancelled`. Connectivity problems never surface as errors to the
//! caller; they are recorded on the job.
//!
//! Exchange with the analyzer:
//!
//! ```text
//! LIS  -> ENQ              analyzer -> ACK
//! LIS  -> [H frame]        analyzer -> ACK
//! LIS  -> EOT
//! analyzer -> ENQ          LIS -> ACK
//! analyzer -> [frame]...   LIS -> ACK (NAK on a bad checksum)
//! analyzer -> EOT
//! ```

use crate::config::CoreConfig;
use crate::constants::{MAX_FRAME_RETRIES, QUERY_HEADER_RECORD};
use crate::events::{AnalyzerEvent, EventBus};
use crate::model::{Analyzer, AnalyzerField, FieldType};
use crate::store::{AnalyzerStore, AnalyzerStoreExt};
use crate::{CoreError, CoreResult};
use astm::frame::{self, ACK, ENQ, EOT, ETB, ETX, NAK, STX};
use chrono::{DateTime, Utc};
use lis_types::NonEmptyText;
use lis_uuid::EntityId;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

// ============================================================================
// JOB STATUS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Poll result for one job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub analyzer_id: EntityId,
    pub job_id: EntityId,
    pub state: JobState,
    /// Percentage, `0` to `100`.
    pub progress: u8,
    pub created_at: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
    pub fields_count: usize,
    /// The analyzer's stored fields, filled only once the job has completed.
    pub fields: Vec<AnalyzerField>,
    pub error: Option<String>,
}

impl JobStatus {
    fn new(analyzer_id: EntityId, job_id: EntityId) -> Self {
        Self {
            analyzer_id,
            job_id,
            state: JobState::Pending,
            progress: 0,
            created_at: Some(Utc::now()),
            logs: Vec::new(),
            fields_count: 0,
            fields: Vec::new(),
            error: None,
        }
    }

    fn not_found(analyzer_id: EntityId, job_id: EntityId) -> Self {
        Self {
            state: JobState::NotFound,
            created_at: None,
            ..Self::new(analyzer_id, job_id)
        }
    }
}

/// A field described by an analyzer's query response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiscoveredField {
    pub field_name: String,
    /// The raw test identifier field (`^^^WBC^White Blood Cell Count`).
    pub astm_ref: String,
    pub field_type: FieldType,
    pub unit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
}

type JobKey = (EntityId, EntityId);

/// Shared handle a running job uses to report progress.
#[derive(Clone)]
struct JobHandle {
    jobs: Arc<Mutex<HashMap<JobKey, JobStatus>>>,
    key: JobKey,
}

impl JobHandle {
    /// Apply `f` while the job is still pending or running. Every state write of the task goes
    /// through here, so a cancel (or any other terminal state) is never overwritten.
    fn update_live(&self, f: impl FnOnce(&mut JobStatus)) -> Result<(), QueryFailure> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| QueryFailure::Failed("query job table lock poisoned".into()))?;
        match jobs.get_mut(&self.key) {
            Some(status) if !status.state.is_terminal() => {
                f(status);
                Ok(())
            }
            _ => Err(QueryFailure::Cancelled),
        }
    }

    /// Move `pending -> in_progress`. Fails if the job left `pending` before the task started.
    fn begin(&self) -> Result<(), QueryFailure> {
        let mut started = false;
        self.update_live(|status| {
            if status.state == JobState::Pending {
                status.state = JobState::InProgress;
                started = true;
            }
        })?;
        if started {
            Ok(())
        } else {
            Err(QueryFailure::Cancelled)
        }
    }

    /// Record a step. Fails once the job has been cancelled so the task can stop.
    fn step(&self, progress: Option<u8>, message: &str) -> Result<(), QueryFailure> {
        let entry = format!("[{}] {}", Utc::now().format("%H:%M:%S%.3f"), message);
        self.update_live(|status| {
            if let Some(progress) = progress {
                status.progress = progress;
            }
            status.logs.push(entry);
        })?;
        tracing::info!("query job {}: {}", self.key.1, message);
        Ok(())
    }
}

/// Why a job stopped early.
#[derive(Debug)]
enum QueryFailure {
    Cancelled,
    Failed(String),
}

impl From<std::io::Error> for QueryFailure {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<CoreError> for QueryFailure {
    fn from(e: CoreError) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<astm::AstmError> for QueryFailure {
    fn from(e: astm::AstmError) -> Self {
        Self::Failed(e.to_string())
    }
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct QueryService {
    store: Arc<dyn AnalyzerStore>,
    bus: Arc<EventBus>,
    jobs: Arc<Mutex<HashMap<JobKey, JobStatus>>>,
    connect_timeout: Duration,
    query_timeout: Duration,
    allow_loopback: bool,
}

impl QueryService {
    pub fn new(store: Arc<dyn AnalyzerStore>, bus: Arc<EventBus>, config: &CoreConfig) -> Self {
        Self {
            store,
            bus,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout: config.connect_timeout(),
            query_timeout: config.query_timeout(),
            allow_loopback: config.allow_loopback_queries(),
        }
    }

    /// Start a background query of `analyzer_id` and return the job id.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] for an unknown analyzer
    /// - [`CoreError::QueryRejected`] for push-only transports, analyzers without an address or
    ///   port, or when no runtime is available
    pub fn start_query(&self, analyzer_id: EntityId) -> CoreResult<EntityId> {
        let analyzer = self.store.require_analyzer(analyzer_id)?;
        let (ip, port) = queryable_address(&analyzer)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CoreError::QueryRejected("no async runtime to run the query".into()))?;

        let job_id = EntityId::new();
        let key = (analyzer_id, job_id);
        self.lock_jobs()?
            .insert(key, JobStatus::new(analyzer_id, job_id));

        let job = QueryJob {
            store: Arc::clone(&self.store),
            handle: JobHandle {
                jobs: Arc::clone(&self.jobs),
                key,
            },
            address: SocketAddr::new(ip, port),
            connect_timeout: self.connect_timeout,
            query_timeout: self.query_timeout,
            allow_loopback: self.allow_loopback,
        };
        runtime.spawn(job.run());
        tracing::info!("started query job {job_id} for analyzer {analyzer_id}");
        Ok(job_id)
    }

    /// Non-blocking poll. Unknown jobs report [`JobState::NotFound`].
    pub fn status(&self, analyzer_id: EntityId, job_id: EntityId) -> CoreResult<JobStatus> {
        let Some(mut status) = self.lock_jobs()?.get(&(analyzer_id, job_id)).cloned() else {
            return Ok(JobStatus::not_found(analyzer_id, job_id));
        };
        if status.state == JobState::Completed {
            status.fields = self.store.fields_for_analyzer(analyzer_id)?;
        }
        Ok(status)
    }

    /// Best-effort cancel. A pending job never starts and a running task stops at its next step;
    /// finished jobs are left as they are.
    pub fn cancel(&self, analyzer_id: EntityId, job_id: EntityId) -> CoreResult<()> {
        let mut jobs = self.lock_jobs()?;
        if let Some(status) = jobs.get_mut(&(analyzer_id, job_id)) {
            if !status.state.is_terminal() {
                status.state = JobState::Cancelled;
                status.logs.push("Query cancelled by user".into());
                tracing::info!("query job {job_id} cancelled");
            }
        }
        Ok(())
    }

    /// ENQ/ACK probe. Publishes the outcome so the status machine can react.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] or [`CoreError::QueryRejected`] as for [`Self::start_query`];
    /// an unreachable analyzer is a failed result, not an error.
    pub async fn test_connection(&self, analyzer_id: EntityId) -> CoreResult<ConnectionTestResult> {
        let analyzer = self.store.require_analyzer(analyzer_id)?;
        let (ip, port) = queryable_address(&analyzer)?;

        let outcome = if is_blocked_address(ip) && !self.allow_loopback {
            Err("Connection to this address is not permitted".to_string())
        } else {
            probe(SocketAddr::new(ip, port), self.connect_timeout).await
        };

        let result = match outcome {
            Ok(()) => {
                self.bus
                    .publish(&AnalyzerEvent::ConnectionTestSucceeded { analyzer_id });
                ConnectionTestResult {
                    success: true,
                    message: format!("Analyzer at {ip}:{port} acknowledged ENQ"),
                }
            }
            Err(reason) => {
                tracing::warn!("connection test for analyzer {analyzer_id} failed: {reason}");
                self.bus.publish(&AnalyzerEvent::ConnectionTestFailed {
                    analyzer_id,
                    reason: reason.clone(),
                });
                ConnectionTestResult {
                    success: false,
                    message: reason,
                }
            }
        };
        Ok(result)
    }

    fn lock_jobs(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<JobKey, JobStatus>>> {
        self.jobs
            .lock()
            .map_err(|_| CoreError::Persistence("query job table lock poisoned".into()))
    }
}

fn queryable_address(analyzer: &Analyzer) -> CoreResult<(IpAddr, u16)> {
    if analyzer.transport.is_push_only() {
        return Err(CoreError::QueryRejected(format!(
            "Analyzer uses a push-only transport ({}) and cannot be queried",
            analyzer.transport
        )));
    }
    match (analyzer.ip_address, analyzer.port) {
        (Some(ip), Some(port)) => Ok((ip, port)),
        _ => Err(CoreError::QueryRejected(
            "Analyzer has no TCP/IP connection details configured".into(),
        )),
    }
}

/// Addresses a query may never connect to: loopback, link-local, multicast, unspecified and
/// broadcast, including their IPv4-mapped IPv6 forms.
pub fn is_blocked_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_blocked_address(IpAddr::V4(v4)),
            None => {
                v6.is_loopback()
                    || v6.is_multicast()
                    || v6.is_unspecified()
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        },
    }
}

async fn probe(address: SocketAddr, connect_timeout: Duration) -> Result<(), String> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| format!("Connection to {address} timed out"))?
        .map_err(|e| format!("Connection to {address} failed: {e}"))?;
    stream
        .write_all(&[ENQ])
        .await
        .map_err(|e| format!("Failed to send ENQ: {e}"))?;
    let reply = tokio::time::timeout(connect_timeout, stream.read_u8())
        .await
        .map_err(|_| "No response to ENQ".to_string())?
        .map_err(|e| format!("Failed to read response: {e}"))?;
    if reply != ACK {
        return Err(format!("Expected ACK (0x06), received: 0x{reply:02X}"));
    }
    // Release the line again.
    if let Err(e) = stream.write_all(&[EOT]).await {
        tracing::warn!("failed to send EOT to {address} after connection test: {e}");
    }
    Ok(())
}

// ============================================================================
// JOB TASK
// ============================================================================

struct QueryJob {
    store: Arc<dyn AnalyzerStore>,
    handle: JobHandle,
    address: SocketAddr,
    connect_timeout: Duration,
    query_timeout: Duration,
    allow_loopback: bool,
}

impl QueryJob {
    async fn run(self) {
        let handle = self.handle.clone();
        let outcome = match tokio::time::timeout(self.query_timeout, self.execute()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(QueryFailure::Failed("Query timed out".into())),
        };

        let finished = match outcome {
            Ok(stored) => handle.update_live(|status| {
                status.state = JobState::Completed;
                status.progress = 100;
                status.fields_count = stored;
                status
                    .logs
                    .push(format!("Query completed successfully. {stored} fields saved."));
            }),
            Err(QueryFailure::Cancelled) => Err(QueryFailure::Cancelled),
            Err(QueryFailure::Failed(message)) => {
                tracing::error!("query job {} failed: {}", handle.key.1, message);
                handle.update_live(|status| {
                    status.state = JobState::Failed;
                    status.logs.push(format!("Query failed: {message}"));
                    status.error = Some(message);
                })
            }
        };
        match finished {
            Ok(()) => {}
            Err(QueryFailure::Cancelled) => {
                tracing::info!("query job {} stopped after cancellation", handle.key.1)
            }
            Err(QueryFailure::Failed(message)) => {
                tracing::error!("query job {} result not recorded: {}", handle.key.1, message)
            }
        }
    }

    async fn execute(&self) -> Result<usize, QueryFailure> {
        let job = &self.handle;
        job.begin()?;
        job.step(Some(10), "Starting query job")?;

        if is_blocked_address(self.address.ip()) && !self.allow_loopback {
            return Err(QueryFailure::Failed(
                "Connection to this address is not permitted".into(),
            ));
        }
        job.step(Some(20), &format!("Connecting to analyzer at {}", self.address))?;

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| QueryFailure::Failed(format!("Connection to {} timed out", self.address)))??;
        let mut stream = BufStream::new(tcp);
        job.step(Some(30), "TCP connection established")?;

        job.step(None, "Sending ENQ (Enquiry)")?;
        send(&mut stream, &[ENQ]).await?;
        expect(&mut stream, ACK, "Expected ACK").await?;
        job.step(Some(40), "Received ACK (Acknowledge)")?;

        job.step(None, "Sending query message (header record)")?;
        send(&mut stream, &frame::encode_frame(1, QUERY_HEADER_RECORD)?).await?;
        expect(&mut stream, ACK, "Frame not ACKed").await?;
        job.step(None, "Sending EOT (End of Transmission)")?;
        send(&mut stream, &[EOT]).await?;
        job.step(Some(50), "Waiting for analyzer response")?;

        expect(&mut stream, ENQ, "Expected ENQ from analyzer").await?;
        send(&mut stream, &[ACK]).await?;
        job.step(Some(60), "Receiving field data frames")?;

        let records = receive_records(&mut stream, job).await?;
        job.step(Some(80), &format!("Parsing {} records", records.len()))?;
        let discovered = parse_field_records(&records);
        job.step(Some(90), &format!("Storing {} fields", discovered.len()))?;

        let stored = store_fields(self.store.as_ref(), job.key.0, &discovered)?;
        Ok(stored)
    }
}

async fn send(stream: &mut BufStream<TcpStream>, bytes: &[u8]) -> Result<(), QueryFailure> {
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn expect(
    stream: &mut BufStream<TcpStream>,
    wanted: u8,
    context: &str,
) -> Result<(), QueryFailure> {
    let received = stream.read_u8().await?;
    if received == wanted {
        Ok(())
    } else {
        Err(QueryFailure::Failed(format!(
            "{context} (0x{wanted:02X}), received: 0x{received:02X}"
        )))
    }
}

/// Read frames until EOT. Intermediate (ETB) frames are joined into one record.
async fn receive_records(
    stream: &mut BufStream<TcpStream>,
    job: &JobHandle,
) -> Result<Vec<String>, QueryFailure> {
    let mut records = Vec::new();
    let mut pending = String::new();
    let mut expected_number = 1u8;
    let mut retries = 0usize;

    loop {
        let first = stream.read_u8().await?;
        if first == EOT {
            job.step(None, "Received EOT, end of transmission")?;
            break;
        }
        if first != STX {
            return Err(QueryFailure::Failed(format!(
                "Expected STX (0x02), received: 0x{first:02X}"
            )));
        }

        let mut raw = vec![STX];
        loop {
            let byte = stream.read_u8().await?;
            raw.push(byte);
            if byte == ETX || byte == ETB {
                break;
            }
        }
        let mut trailer = [0u8; frame::TRAILER_LEN];
        stream.read_exact(&mut trailer).await?;
        raw.extend_from_slice(&trailer);

        let decoded = match frame::decode_frame(&raw) {
            Ok(decoded) if decoded.number == expected_number => decoded,
            Ok(decoded) => {
                return Err(QueryFailure::Failed(format!(
                    "Expected frame {expected_number}, received frame {}",
                    decoded.number
                )))
            }
            Err(e) => {
                retries += 1;
                if retries > MAX_FRAME_RETRIES {
                    return Err(QueryFailure::Failed(format!(
                        "Giving up after {MAX_FRAME_RETRIES} rejected frames: {e}"
                    )));
                }
                job.step(None, &format!("Rejected frame {expected_number}: {e}"))?;
                send(stream, &[NAK]).await?;
                continue;
            }
        };
        retries = 0;

        let preview: String = decoded.data.chars().take(50).collect();
        job.step(None, &format!("Received frame {}: {}", decoded.number, preview))?;
        pending.push_str(&decoded.data);
        if decoded.is_final {
            records.push(std::mem::take(&mut pending));
        }
        send(stream, &[ACK]).await?;
        expected_number = frame::next_frame_number(expected_number);
    }

    if !pending.is_empty() {
        records.push(pending);
    }
    Ok(records)
}

// ============================================================================
// FIELD DISCOVERY
// ============================================================================

/// Read field descriptions from R records: `R|seq|^^^CODE^Name||unit|||TYPE`.
///
/// The name is the first non-empty component of field 2, falling back to `Field_<seq>`. The type
/// in field 7 defaults to NUMERIC; a NUMERIC field without a unit is taken as QUALITATIVE.
pub fn parse_field_records<S: AsRef<str>>(records: &[S]) -> Vec<DiscoveredField> {
    let mut out = Vec::new();
    for record in records.iter().map(AsRef::as_ref) {
        if !record.starts_with("R|") {
            continue;
        }
        let fields: Vec<&str> = record.split('|').collect();
        if fields.len() < 4 {
            tracing::warn!("R record too short, skipping: {record}");
            continue;
        }

        let astm_ref = fields[2].to_string();
        let field_name = astm_ref
            .split('^')
            .map(str::trim)
            .find(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Field_{}", fields[1].trim()));

        let unit = fields
            .get(4)
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        let mut field_type = match fields.get(7).map(|t| t.trim()).filter(|t| !t.is_empty()) {
            Some(declared) => FieldType::from_str(declared).unwrap_or_else(|_| {
                tracing::warn!("invalid field type '{declared}', using NUMERIC: {record}");
                FieldType::Numeric
            }),
            None => FieldType::Numeric,
        };
        if unit.is_none() && field_type == FieldType::Numeric {
            field_type = FieldType::Qualitative;
        }

        out.push(DiscoveredField {
            field_name,
            astm_ref,
            field_type,
            unit,
        });
    }
    out
}

/// Store discovered fields the analyzer does not have yet. Fields with a known ASTM reference or
/// name, or that break the unit invariant, are skipped.
fn store_fields(
    store: &dyn AnalyzerStore,
    analyzer_id: EntityId,
    discovered: &[DiscoveredField],
) -> CoreResult<usize> {
    let mut fresh = Vec::new();
    for field in discovered {
        let candidate = AnalyzerField {
            id: EntityId::new(),
            analyzer_id,
            field_name: NonEmptyText::new(&field.field_name)?,
            field_type: field.field_type,
            unit: NonEmptyText::optional(field.unit.as_deref())?,
            astm_ref: Some(field.astm_ref.clone()),
            custom_type_id: None,
            is_active: true,
        };
        if let Err(e) = candidate.validate() {
            tracing::warn!("skipping discovered field '{}': {}", field.field_name, e);
            continue;
        }
        fresh.push(candidate);
    }

    let mut stored = 0;
    store.atomically(|tx| {
        for field in fresh {
            let known = tx.fields_for_analyzer(analyzer_id).any(|f| {
                f.astm_ref == field.astm_ref || f.field_name.eq_ignore_case(field.field_name.as_str())
            });
            if known {
                continue;
            }
            tx.put_field(field)?;
            stored += 1;
        }
        Ok(())
    })?;
    tracing::info!("stored {stored} discovered field(s) for analyzer {analyzer_id}");
    Ok(stored)
}
