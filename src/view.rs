use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};

use crate::state::{MatchRecord, MatchStatus};
use crate::store::EntityStore;

/// The instant and timezone that relative filters ("today", "upcoming") are
/// evaluated against. Injected rather than read from the wall clock so views
/// are reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub now: DateTime<Utc>,
    pub offset: FixedOffset,
}

impl Reference {
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self { now, offset }
    }

    pub fn now(offset: FixedOffset) -> Self {
        Self::new(Utc::now(), offset)
    }

    pub fn today(&self) -> NaiveDate {
        self.now.with_timezone(&self.offset).date_naive()
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayRef {
    Today,
    Tomorrow,
    Date(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewFilter {
    All,
    /// Kickoff falls on the given calendar day in the reference timezone.
    OnDay(DayRef),
    /// Kickoff strictly after the reference instant.
    StartsAfterReference,
    StartsAfter(DateTime<Utc>),
    StatusIn(Vec<MatchStatus>),
    AllOf(Vec<ViewFilter>),
}

impl ViewFilter {
    pub fn matches(&self, record: &MatchRecord, reference: &Reference) -> bool {
        match self {
            ViewFilter::All => true,
            ViewFilter::OnDay(day) => {
                let target = match day {
                    DayRef::Today => Some(reference.today()),
                    DayRef::Tomorrow => reference.today().checked_add_days(Days::new(1)),
                    DayRef::Date(date) => Some(*date),
                };
                target == Some(reference.local_date(record.start_time))
            }
            ViewFilter::StartsAfterReference => record.start_time > reference.now,
            ViewFilter::StartsAfter(instant) => record.start_time > *instant,
            ViewFilter::StatusIn(statuses) => statuses.contains(&record.status),
            ViewFilter::AllOf(filters) => filters.iter().all(|f| f.matches(record, reference)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSort {
    StartTimeAsc,
    StartTimeDesc,
    UpdatedDesc,
    FinishedDesc,
}

impl ViewSort {
    /// Total order: the sort key first, then ascending id.
    pub fn compare(self, a: &MatchRecord, b: &MatchRecord) -> Ordering {
        let primary = match self {
            ViewSort::StartTimeAsc => a.start_time.cmp(&b.start_time),
            ViewSort::StartTimeDesc => b.start_time.cmp(&a.start_time),
            ViewSort::UpdatedDesc => desc_missing_last(a.updated_at, b.updated_at),
            ViewSort::FinishedDesc => desc_missing_last(a.finished_at, b.finished_at),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

fn desc_missing_last(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSpec {
    pub filter: ViewFilter,
    pub sort: ViewSort,
    pub limit: Option<usize>,
}

impl ViewSpec {
    pub fn new(filter: ViewFilter, sort: ViewSort) -> Self {
        Self {
            filter,
            sort,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn today() -> Self {
        Self::new(ViewFilter::OnDay(DayRef::Today), ViewSort::StartTimeAsc)
    }

    pub fn tomorrow() -> Self {
        Self::new(ViewFilter::OnDay(DayRef::Tomorrow), ViewSort::StartTimeAsc)
    }

    pub fn upcoming() -> Self {
        Self::new(ViewFilter::StartsAfterReference, ViewSort::StartTimeAsc)
    }

    pub fn scheduled() -> Self {
        Self::new(
            ViewFilter::StatusIn(vec![MatchStatus::Scheduled]),
            ViewSort::StartTimeAsc,
        )
    }

    pub fn live() -> Self {
        Self::new(
            ViewFilter::StatusIn(vec![MatchStatus::Live, MatchStatus::HalfTime]),
            ViewSort::StartTimeAsc,
        )
    }

    pub fn finished(limit: usize) -> Self {
        Self::new(
            ViewFilter::StatusIn(vec![MatchStatus::Finished]),
            ViewSort::FinishedDesc,
        )
        .with_limit(limit)
    }
}

/// Filter, sort and truncate. Records are cloned so the result does not
/// borrow the store.
pub fn project<'a>(
    records: impl IntoIterator<Item = &'a MatchRecord>,
    spec: &ViewSpec,
    reference: &Reference,
) -> Vec<MatchRecord> {
    let mut out: Vec<&MatchRecord> = records
        .into_iter()
        .filter(|record| spec.filter.matches(record, reference))
        .collect();
    out.sort_unstable_by(|a, b| spec.sort.compare(a, b));
    if let Some(limit) = spec.limit {
        out.truncate(limit);
    }
    out.into_iter().cloned().collect()
}

/// Named views over one store, recomputed in full on `refresh`. Locks are
/// always taken `specs` before `cache`.
#[derive(Debug, Default)]
pub struct ViewEngine {
    specs: RwLock<BTreeMap<String, ViewSpec>>,
    cache: RwLock<HashMap<String, Arc<Vec<MatchRecord>>>>,
    recomputes: AtomicU64,
}

impl ViewEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, spec: ViewSpec) {
        let name = name.into();
        let mut specs = self.specs.write().unwrap_or_else(PoisonError::into_inner);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);
        specs.insert(name, spec);
    }

    /// Registers and computes immediately so the view is readable before the
    /// next store change.
    pub fn register_and_compute(
        &self,
        name: impl Into<String>,
        spec: ViewSpec,
        store: &EntityStore,
        reference: &Reference,
    ) {
        let name = name.into();
        let rows = Arc::new(project(store.all(), &spec, reference));
        let mut specs = self.specs.write().unwrap_or_else(PoisonError::into_inner);
        specs.insert(name.clone(), spec);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, rows);
    }

    pub fn names(&self) -> Vec<String> {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn spec(&self, name: &str) -> Option<ViewSpec> {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Vec<MatchRecord>>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn refresh(&self, store: &EntityStore, reference: &Reference) {
        // Held for the whole pass so a concurrent register is not lost.
        let specs = self.specs.read().unwrap_or_else(PoisonError::into_inner);
        let fresh: HashMap<String, Arc<Vec<MatchRecord>>> = specs
            .iter()
            .map(|(name, spec)| {
                let rows = project(store.all(), spec, reference);
                (name.clone(), Arc::new(rows))
            })
            .collect();
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        drop(specs);
        self.recomputes.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// How many times `refresh` has run.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(AtomicOrdering::SeqCst)
    }
}
