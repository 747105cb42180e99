//! Persisted timer jobs with lease-based claiming.
//!
//! Jobs live in the `timers` graph with an absolute due instant. A poll
//! claims a due job by compare-and-set on the old lease state inside the
//! graph's write lock, which yields at-most-one firing per job per
//! due-window even with several workers polling.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::store::{GraphOp, GraphStore};
use crate::types::{TimerJob, TimerStatus};
use crate::vocab::{self, GRAPH_TIMERS};

/// Parsed timer definition: the first due instant plus an optional repeat
/// count for `R<n>/PT...` cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSchedule {
    pub due_at: DateTime<Utc>,
    pub interval: Option<Duration>,
    pub repeats: Option<u32>,
}

/// Parse an ISO-8601 timer definition: a duration (`PT5S`, `P1DT2H`), an
/// absolute dateTime, or a bounded cycle (`R3/PT10S`).
pub fn parse_timer_definition(text: &str, now: DateTime<Utc>) -> Result<TimerSchedule> {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix('R') {
        let (count, duration) = rest.split_once('/').ok_or_else(|| {
            EngineError::BadDefinition(format!("invalid timer cycle {trimmed}"))
        })?;
        let repeats: u32 = count
            .parse()
            .map_err(|_| EngineError::BadDefinition(format!("invalid cycle count {count}")))?;
        let interval = parse_iso8601_duration(duration)?;
        return Ok(TimerSchedule {
            due_at: now + interval,
            interval: Some(interval),
            repeats: Some(repeats),
        });
    }
    if trimmed.starts_with('P') {
        let interval = parse_iso8601_duration(trimmed)?;
        return Ok(TimerSchedule {
            due_at: now + interval,
            interval: None,
            repeats: None,
        });
    }
    let absolute = DateTime::parse_from_rfc3339(trimmed)
        .map_err(|_| EngineError::BadDefinition(format!("invalid timer definition {trimmed}")))?;
    Ok(TimerSchedule {
        due_at: absolute.with_timezone(&Utc),
        interval: None,
        repeats: None,
    })
}

/// `P[nD][T[nH][nM][nS]]`; fractional seconds are accepted.
fn parse_iso8601_duration(text: &str) -> Result<Duration> {
    let body = text
        .strip_prefix('P')
        .ok_or_else(|| EngineError::BadDefinition(format!("invalid duration {text}")))?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };
    let mut total_ms: i64 = 0;
    let mut parse_units = |part: &str, units: &[(char, i64)]| -> Result<()> {
        let mut number = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let scale = units
                .iter()
                .find(|(u, _)| *u == c)
                .map(|(_, ms)| *ms)
                .ok_or_else(|| {
                    EngineError::BadDefinition(format!("invalid duration unit {c} in {text}"))
                })?;
            let value: f64 = number
                .parse()
                .map_err(|_| EngineError::BadDefinition(format!("invalid duration {text}")))?;
            total_ms += (value * scale as f64) as i64;
            number.clear();
        }
        if !number.is_empty() {
            return Err(EngineError::BadDefinition(format!(
                "trailing number in duration {text}"
            )));
        }
        Ok(())
    };
    parse_units(date_part, &[('Y', 31_536_000_000), ('W', 604_800_000), ('D', 86_400_000)])?;
    parse_units(time_part, &[('H', 3_600_000), ('M', 60_000), ('S', 1_000)])?;
    Ok(Duration::milliseconds(total_ms))
}

pub struct TimerService {
    store: Arc<GraphStore>,
    config: Arc<EngineConfig>,
}

impl TimerService {
    pub fn new(store: Arc<GraphStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub async fn schedule(
        &self,
        instance_id: Uuid,
        token_id: Uuid,
        node_id: &str,
        due_at: DateTime<Utc>,
        cycle_remaining: Option<u32>,
    ) -> Result<TimerJob> {
        let id = Uuid::now_v7();
        let subject = vocab::timer_iri(id);
        let mut ops = vec![
            GraphOp::insert(
                &subject,
                &NamedNode::new_unchecked(vocab::RDF_TYPE.as_str()),
                Term::NamedNode(vocab::timer::class_timer_job()),
            ),
            GraphOp::insert(
                &subject,
                &vocab::timer::instance(),
                Term::NamedNode(vocab::instance_iri(instance_id)),
            ),
            GraphOp::insert(
                &subject,
                &vocab::timer::token(),
                Term::NamedNode(vocab::token_iri(token_id)),
            ),
            GraphOp::insert(&subject, &vocab::timer::node(), Literal::from(node_id)),
            GraphOp::insert(&subject, &vocab::timer::due_at(), datetime_literal(due_at)),
            GraphOp::insert(
                &subject,
                &vocab::timer::status(),
                Literal::from(TimerStatus::DuePending.as_str()),
            ),
            GraphOp::insert(
                &subject,
                &vocab::timer::attempts(),
                integer_literal(0),
            ),
        ];
        if let Some(remaining) = cycle_remaining {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::timer::cycle_remaining(),
                integer_literal(remaining as i64),
            ));
        }
        self.store.apply(GRAPH_TIMERS, ops).await?;
        tracing::debug!(timer = %id, instance = %instance_id, node = node_id, due = %due_at, "timer scheduled");
        self.get(id)
    }

    pub fn get(&self, timer_id: Uuid) -> Result<TimerJob> {
        let subject = vocab::timer_iri(timer_id);
        let props = self.store.properties(GRAPH_TIMERS, &subject)?;
        if props.is_empty() {
            return Err(EngineError::not_found("timer", timer_id.to_string()));
        }
        let mut job = TimerJob {
            id: timer_id,
            instance_id: Uuid::nil(),
            token_id: Uuid::nil(),
            node_id: String::new(),
            due_at: Utc::now(),
            status: TimerStatus::DuePending,
            lease_holder: None,
            lease_expires_at: None,
            attempts: 0,
            cycle_remaining: None,
        };
        for (predicate, object) in props {
            match predicate.as_str() {
                p if p == vocab::timer::instance().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        if let Some(id) = vocab::uuid_from_iri(n.as_str()) {
                            job.instance_id = id;
                        }
                    }
                }
                p if p == vocab::timer::token().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        if let Some(id) = vocab::uuid_from_iri(n.as_str()) {
                            job.token_id = id;
                        }
                    }
                }
                p if p == vocab::timer::node().as_str() => {
                    job.node_id = literal_value(&object).unwrap_or_default();
                }
                p if p == vocab::timer::due_at().as_str() => {
                    if let Some(t) = parse_datetime(&object) {
                        job.due_at = t;
                    }
                }
                p if p == vocab::timer::status().as_str() => {
                    if let Some(s) = literal_value(&object).and_then(|s| TimerStatus::parse(&s)) {
                        job.status = s;
                    }
                }
                p if p == vocab::timer::lease_holder().as_str() => {
                    job.lease_holder = literal_value(&object);
                }
                p if p == vocab::timer::lease_expires_at().as_str() => {
                    job.lease_expires_at = parse_datetime(&object);
                }
                p if p == vocab::timer::attempts().as_str() => {
                    job.attempts = literal_value(&object)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                }
                p if p == vocab::timer::cycle_remaining().as_str() => {
                    job.cycle_remaining = literal_value(&object).and_then(|s| s.parse().ok());
                }
                _ => {}
            }
        }
        Ok(job)
    }

    /// Ids of jobs whose due instant has passed and whose lease (if any)
    /// has expired, ordered by due instant.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let sparql = format!(
            "SELECT ?job ?due WHERE {{ \
               ?job <{status}> ?s . \
               ?job <{due}> ?due . \
               FILTER(?due <= {now}) \
               FILTER(?s = \"DUE_PENDING\" || (?s = \"LEASED\" && EXISTS {{ \
                 ?job <{expires}> ?exp . FILTER(?exp < {now}) }})) \
             }} ORDER BY ?due",
            status = vocab::timer::status().as_str(),
            due = vocab::timer::due_at().as_str(),
            expires = vocab::timer::lease_expires_at().as_str(),
            now = sparql_datetime(now),
        );
        let mut out = Vec::new();
        for solution in self.store.select(GRAPH_TIMERS, &sparql)? {
            if let Some(Term::NamedNode(n)) = solution.get("job") {
                if let Some(id) = vocab::uuid_from_iri(n.as_str()) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    /// Atomically claim a due job for `worker`. The guard re-checks the old
    /// lease state inside the write lock; losing the race returns `None`.
    pub async fn try_claim(
        &self,
        timer_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TimerJob>> {
        let subject = vocab::timer_iri(timer_id);
        let guard = format!(
            "ASK {{ \
               {{ <{s}> <{status}> \"DUE_PENDING\" }} UNION {{ \
                 <{s}> <{status}> \"LEASED\" . \
                 <{s}> <{expires}> ?exp . FILTER(?exp < {now}) }} \
             }}",
            s = subject.as_str(),
            status = vocab::timer::status().as_str(),
            expires = vocab::timer::lease_expires_at().as_str(),
            now = sparql_datetime(now),
        );
        let expires = now + Duration::milliseconds(self.config.timer_lease_ttl_ms as i64);
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::timer::status(),
            Literal::from(TimerStatus::Leased.as_str()),
        )
        .to_vec();
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::timer::lease_holder(),
            Literal::from(worker),
        ));
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::timer::lease_expires_at(),
            datetime_literal(expires),
        ));
        if self.store.apply_if(GRAPH_TIMERS, &guard, ops).await? {
            Ok(Some(self.get(timer_id)?))
        } else {
            Ok(None)
        }
    }

    /// Renew the lease held by `worker`; fails the CAS if the lease moved.
    pub async fn renew_lease(
        &self,
        timer_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let subject = vocab::timer_iri(timer_id);
        let guard = format!(
            "ASK {{ <{s}> <{status}> \"LEASED\" . <{s}> <{holder}> \"{worker}\" }}",
            s = subject.as_str(),
            status = vocab::timer::status().as_str(),
            holder = vocab::timer::lease_holder().as_str(),
            worker = worker,
        );
        let expires = now + Duration::milliseconds(self.config.timer_lease_ttl_ms as i64);
        let ops = GraphOp::replace(
            &subject,
            &vocab::timer::lease_expires_at(),
            datetime_literal(expires),
        )
        .to_vec();
        self.store.apply_if(GRAPH_TIMERS, &guard, ops).await
    }

    pub async fn mark_fired(&self, timer_id: Uuid) -> Result<()> {
        let subject = vocab::timer_iri(timer_id);
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::timer::status(),
            Literal::from(TimerStatus::Fired.as_str()),
        )
        .to_vec();
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_holder()),
            None,
        ));
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_expires_at()),
            None,
        ));
        self.store.apply(GRAPH_TIMERS, ops).await
    }

    /// Give a claimed job back untouched (target busy): DUE_PENDING again
    /// without spending an attempt.
    pub async fn release(&self, timer_id: Uuid) -> Result<()> {
        let subject = vocab::timer_iri(timer_id);
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::timer::status(),
            Literal::from(TimerStatus::DuePending.as_str()),
        )
        .to_vec();
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_holder()),
            None,
        ));
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_expires_at()),
            None,
        ));
        self.store.apply(GRAPH_TIMERS, ops).await
    }

    /// A failed execution clears the lease so the next poll retries, until
    /// the attempt budget is spent.
    pub async fn record_failure(&self, timer_id: Uuid) -> Result<()> {
        let job = self.get(timer_id)?;
        let subject = vocab::timer_iri(timer_id);
        let attempts = job.attempts + 1;
        let next_status = if attempts >= self.config.timer_max_attempts {
            tracing::warn!(timer = %timer_id, attempts, "timer job abandoned");
            TimerStatus::Cancelled
        } else {
            TimerStatus::DuePending
        };
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::timer::status(),
            Literal::from(next_status.as_str()),
        )
        .to_vec();
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::timer::attempts(),
            integer_literal(attempts as i64),
        ));
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_holder()),
            None,
        ));
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_expires_at()),
            None,
        ));
        self.store.apply(GRAPH_TIMERS, ops).await
    }

    pub async fn cancel(&self, timer_id: Uuid) -> Result<()> {
        let subject = vocab::timer_iri(timer_id);
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::timer::status(),
            Literal::from(TimerStatus::Cancelled.as_str()),
        )
        .to_vec();
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_holder()),
            None,
        ));
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::timer::lease_expires_at()),
            None,
        ));
        self.store.apply(GRAPH_TIMERS, ops).await
    }

    /// Cancel every live job owned by one token (scope exit, activity
    /// cancellation).
    pub async fn cancel_for_token(&self, token_id: Uuid) -> Result<()> {
        for job in self.jobs_for(&vocab::timer::token(), &vocab::token_iri(token_id))? {
            if matches!(job.status, TimerStatus::DuePending | TimerStatus::Leased) {
                self.cancel(job.id).await?;
            }
        }
        Ok(())
    }

    pub async fn cancel_for_instance(&self, instance_id: Uuid) -> Result<()> {
        for job in self.jobs_for(&vocab::timer::instance(), &vocab::instance_iri(instance_id))? {
            if matches!(job.status, TimerStatus::DuePending | TimerStatus::Leased) {
                self.cancel(job.id).await?;
            }
        }
        Ok(())
    }

    fn jobs_for(&self, predicate: &NamedNode, object: &NamedNode) -> Result<Vec<TimerJob>> {
        let subjects = self
            .store
            .subjects(GRAPH_TIMERS, predicate, &Term::NamedNode(object.clone()))?;
        let mut out = Vec::new();
        for subject in subjects {
            if let Some(id) = vocab::uuid_from_iri(subject.as_str()) {
                out.push(self.get(id)?);
            }
        }
        Ok(out)
    }

    /// Restart recovery: leases that expired while the process was down go
    /// back to DUE_PENDING.
    pub async fn reset_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let sparql = format!(
            "SELECT ?job WHERE {{ \
               ?job <{status}> \"LEASED\" . \
               ?job <{expires}> ?exp . FILTER(?exp < {now}) }}",
            status = vocab::timer::status().as_str(),
            expires = vocab::timer::lease_expires_at().as_str(),
            now = sparql_datetime(now),
        );
        let mut reset = 0;
        for solution in self.store.select(GRAPH_TIMERS, &sparql)? {
            let Some(Term::NamedNode(n)) = solution.get("job") else {
                continue;
            };
            let Some(id) = vocab::uuid_from_iri(n.as_str()) else {
                continue;
            };
            let subject = vocab::timer_iri(id);
            let mut ops = GraphOp::replace(
                &subject,
                &vocab::timer::status(),
                Literal::from(TimerStatus::DuePending.as_str()),
            )
            .to_vec();
            ops.push(GraphOp::remove(
                Some(&subject),
                Some(&vocab::timer::lease_holder()),
                None,
            ));
            ops.push(GraphOp::remove(
                Some(&subject),
                Some(&vocab::timer::lease_expires_at()),
                None,
            ));
            self.store.apply(GRAPH_TIMERS, ops).await?;
            reset += 1;
        }
        if reset > 0 {
            tracing::info!(reset, "reset expired timer leases after restart");
        }
        Ok(reset)
    }
}

fn datetime_literal(t: DateTime<Utc>) -> Literal {
    Literal::new_typed_literal(
        t.to_rfc3339_opts(SecondsFormat::Micros, true),
        oxigraph::model::vocab::xsd::DATE_TIME,
    )
}

fn integer_literal(n: i64) -> Literal {
    Literal::new_typed_literal(n.to_string(), oxigraph::model::vocab::xsd::INTEGER)
}

fn sparql_datetime(t: DateTime<Utc>) -> String {
    format!(
        "\"{}\"^^<http://www.w3.org/2001/XMLSchema#dateTime>",
        t.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

fn literal_value(term: &Term) -> Option<String> {
    match term {
        Term::Literal(lit) => Some(lit.value().to_string()),
        _ => None,
    }
}

fn parse_datetime(term: &Term) -> Option<DateTime<Utc>> {
    literal_value(term)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TimerService {
        let store = Arc::new(GraphStore::open(None).unwrap());
        TimerService::new(store, Arc::new(EngineConfig::default()))
    }

    #[test]
    fn duration_parsing() {
        let d = parse_iso8601_duration("PT0S").unwrap();
        assert_eq!(d, Duration::zero());
        assert_eq!(
            parse_iso8601_duration("PT1H30M").unwrap(),
            Duration::minutes(90)
        );
        assert_eq!(
            parse_iso8601_duration("P1DT2H").unwrap(),
            Duration::hours(26)
        );
        assert!(parse_iso8601_duration("5 seconds").is_err());
    }

    #[test]
    fn cycle_parsing() {
        let now = Utc::now();
        let schedule = parse_timer_definition("R3/PT10S", now).unwrap();
        assert_eq!(schedule.repeats, Some(3));
        assert_eq!(schedule.interval, Some(Duration::seconds(10)));
        assert_eq!(schedule.due_at, now + Duration::seconds(10));
    }

    #[tokio::test]
    async fn schedule_and_poll() {
        let timers = service();
        let now = Utc::now();
        let job = timers
            .schedule(Uuid::now_v7(), Uuid::now_v7(), "boundary1", now - Duration::seconds(1), None)
            .await
            .unwrap();

        let due = timers.due_jobs(now).unwrap();
        assert_eq!(due, vec![job.id]);

        // A job due in the future is not returned.
        timers
            .schedule(Uuid::now_v7(), Uuid::now_v7(), "later", now + Duration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(timers.due_jobs(now).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let timers = service();
        let now = Utc::now();
        let job = timers
            .schedule(Uuid::now_v7(), Uuid::now_v7(), "n", now - Duration::seconds(1), None)
            .await
            .unwrap();

        let first = timers.try_claim(job.id, "w1", now).await.unwrap();
        assert!(first.is_some());
        let claimed = first.unwrap();
        assert_eq!(claimed.status, TimerStatus::Leased);
        assert_eq!(claimed.lease_holder.as_deref(), Some("w1"));
        assert!(claimed.lease_expires_at.unwrap() > now);

        let second = timers.try_claim(job.id, "w2", now).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn contended_claim_has_single_winner() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let timers = Arc::new(TimerService::new(store, Arc::new(EngineConfig::default())));
        let now = Utc::now();
        let job = timers
            .schedule(Uuid::now_v7(), Uuid::now_v7(), "n", now - Duration::seconds(1), None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for worker in 0..8 {
            let timers = timers.clone();
            handles.push(tokio::spawn(async move {
                timers
                    .try_claim(job.id, &format!("w{worker}"), now)
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let config = EngineConfig {
            timer_lease_ttl_ms: 10,
            ..Default::default()
        };
        let timers = TimerService::new(store, Arc::new(config));
        let now = Utc::now();
        let job = timers
            .schedule(Uuid::now_v7(), Uuid::now_v7(), "n", now - Duration::seconds(1), None)
            .await
            .unwrap();

        assert!(timers.try_claim(job.id, "w1", now).await.unwrap().is_some());
        // Past the TTL the lease is stale and another worker may claim.
        let later = now + Duration::seconds(1);
        let stolen = timers.try_claim(job.id, "w2", later).await.unwrap();
        assert_eq!(stolen.unwrap().lease_holder.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn failure_clears_lease_until_budget() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let config = EngineConfig {
            timer_max_attempts: 2,
            ..Default::default()
        };
        let timers = TimerService::new(store, Arc::new(config));
        let now = Utc::now();
        let job = timers
            .schedule(Uuid::now_v7(), Uuid::now_v7(), "n", now - Duration::seconds(1), None)
            .await
            .unwrap();

        timers.try_claim(job.id, "w1", now).await.unwrap();
        timers.record_failure(job.id).await.unwrap();
        let reloaded = timers.get(job.id).unwrap();
        assert_eq!(reloaded.status, TimerStatus::DuePending);
        assert_eq!(reloaded.attempts, 1);
        assert!(reloaded.lease_holder.is_none());

        timers.try_claim(job.id, "w1", now).await.unwrap();
        timers.record_failure(job.id).await.unwrap();
        assert_eq!(timers.get(job.id).unwrap().status, TimerStatus::Cancelled);
    }

    #[tokio::test]
    async fn restart_resets_expired_leases() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let config = EngineConfig {
            timer_lease_ttl_ms: 5,
            ..Default::default()
        };
        let timers = TimerService::new(store, Arc::new(config));
        let now = Utc::now();
        let job = timers
            .schedule(Uuid::now_v7(), Uuid::now_v7(), "n", now - Duration::seconds(1), None)
            .await
            .unwrap();
        timers.try_claim(job.id, "w1", now).await.unwrap();

        let reset = timers
            .reset_expired_leases(now + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(reset, 1);
        assert_eq!(timers.get(job.id).unwrap().status, TimerStatus::DuePending);
    }
}
