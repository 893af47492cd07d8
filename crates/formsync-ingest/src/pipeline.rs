//! Ingestion pipeline
//!
//! One run walks every configured form in order:
//!
//! 1. fetch all submissions (paged, via [`record_stream`])
//! 2. normalize them and upsert the form's own target
//! 3. discover repeat groups, fetch separately exported ones concurrently
//! 4. link, normalize and upsert each group in discovery order
//!
//! A form or group that fails is recorded in the [`RunSummary`] and the run
//! carries on with the rest. Mirror mode instead copies every Ona form's raw
//! submissions into a collection of the same name.

use chrono::{DateTime, Utc};
use formsync_common::RawRecord;
use futures::future::join_all;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::FetchError;
use crate::fetch::{record_stream, FetchBatch, OnaFetcher, RemoteFetcher, RepeatLayout};
use crate::flatten::{
    discover_repeat_groups, discover_with_remote, expand, inferred_group_spec, GroupSource, ParentLink,
    ParentRow, RepeatGroup,
};
use crate::normalize::{dedupe_links, normalize_batch, normalize_child};
use crate::notify::{deliver, Notification, Notifier};
use crate::registry::{FieldSpec, FormDefinition, SchemaRegistry};
use crate::sink::{RawDocumentSink, UpsertSink, UpsertTarget};
use crate::summary::{FormOutcome, GroupOutcome, RecordCounts, RunSummary, UnitStatus};

/// Reason recorded for a group whose enclosing group produced no rows to link to
pub const ENCLOSING_UNAVAILABLE: &str = "enclosing group unavailable";

/// Owners of every table or collection the run may write to.
///
/// Seeded with the registry's declared targets; repeat groups discovered at
/// runtime claim theirs as they come and may not take one already owned.
struct TargetClaims {
    owners: HashMap<String, String>,
}

impl TargetClaims {
    fn new(declared: &HashMap<String, String>) -> Self {
        Self {
            owners: declared.clone(),
        }
    }

    /// Claim `target` for `form_id`, returning the current owner when taken
    fn claim(&mut self, target: &str, form_id: &str) -> Result<(), String> {
        match self.owners.get(target) {
            Some(owner) => Err(owner.clone()),
            None => {
                self.owners.insert(target.to_string(), form_id.to_string());
                Ok(())
            },
        }
    }
}

enum Mode {
    Forms {
        registry: Arc<SchemaRegistry>,
        fetcher: Arc<dyn RemoteFetcher>,
        sink: Arc<dyn UpsertSink>,
    },
    Mirror {
        ona: Arc<OnaFetcher>,
        sink: Arc<dyn RawDocumentSink>,
    },
}

pub struct Pipeline {
    name: String,
    sink_name: String,
    mode: Mode,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Pipeline {
    /// Ingest the forms of `registry` from `fetcher` into `sink`
    pub fn new(
        name: impl Into<String>,
        registry: Arc<SchemaRegistry>,
        fetcher: Arc<dyn RemoteFetcher>,
        sink: Arc<dyn UpsertSink>,
    ) -> Self {
        Self {
            name: name.into(),
            sink_name: sink.name().to_string(),
            mode: Mode::Forms {
                registry,
                fetcher,
                sink,
            },
            notifier: None,
        }
    }

    /// Copy every Ona form's raw submissions into the document store
    pub fn mirror(name: impl Into<String>, ona: Arc<OnaFetcher>, sink: Arc<dyn RawDocumentSink>) -> Self {
        Self {
            name: name.into(),
            sink_name: "mongo".to_string(),
            mode: Mode::Mirror { ona, sink },
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, scheduled_at: DateTime<Utc>) -> RunSummary {
        let started_at = Utc::now();
        info!(pipeline = %self.name, scheduled_at = %scheduled_at, "Starting ingestion run");

        let (source, forms) = match &self.mode {
            Mode::Forms {
                registry,
                fetcher,
                sink,
            } => {
                let mut claims = TargetClaims::new(registry.targets());
                let mut outcomes = Vec::with_capacity(registry.len());
                for form in registry.forms() {
                    outcomes.push(run_form(form, fetcher, sink.as_ref(), &mut claims).await);
                }
                (fetcher.source_name().to_string(), outcomes)
            },
            Mode::Mirror { ona, sink } => ("ona".to_string(), run_mirror(ona, sink.as_ref()).await),
        };

        let summary = RunSummary {
            pipeline: self.name.clone(),
            source,
            sink: self.sink_name.clone(),
            scheduled_at,
            started_at,
            finished_at: Utc::now(),
            status: RunSummary::aggregate(&forms),
            forms,
        };

        let totals = summary.totals();
        info!(
            pipeline = %self.name,
            status = %summary.status,
            forms = summary.forms.len(),
            upserted = totals.upserted,
            dropped = totals.dropped,
            failed = totals.failed,
            "Ingestion run finished"
        );

        if let Some(notifier) = &self.notifier {
            deliver(notifier.as_ref(), &Notification::from_summary(&summary)).await;
        }

        summary
    }
}

async fn run_form(
    form: &FormDefinition,
    fetcher: &Arc<dyn RemoteFetcher>,
    sink: &dyn UpsertSink,
    claims: &mut TargetClaims,
) -> FormOutcome {
    let target = UpsertTarget::for_form(form);
    let mut outcome = FormOutcome::new(&form.id, &target.name);
    info!(form_id = %form.id, source = fetcher.source_name(), "Ingesting form");

    let raws: Vec<RawRecord> = match record_stream(Arc::clone(fetcher), form.id.clone()).try_collect().await {
        Ok(raws) => raws,
        Err(e) => {
            error!(form_id = %form.id, error = %e, "Fetch failed");
            return outcome.failed(e.to_string());
        },
    };
    if raws.is_empty() {
        info!(form_id = %form.id, "No submissions, skipping form");
        return outcome;
    }

    let batch = normalize_batch(&raws, form);
    outcome.counts.fetched = raws.len();
    outcome.counts.dropped = batch.missing_key;
    outcome.counts.duplicates = batch.duplicates;

    if batch.records.is_empty() {
        return outcome.failed(format!("no record has a value for unique key '{}'", form.unique_key));
    }

    match sink.upsert(&target, &batch.records).await {
        Ok(upserted) => {
            outcome.counts.upserted = upserted.succeeded;
            outcome.counts.failed = upserted.failed;
            outcome.rejected = upserted.details;
            outcome.status = UnitStatus::Succeeded;
        },
        Err(e) => {
            error!(form_id = %form.id, target = %target.name, error = %e, "Upsert failed");
            outcome.counts.failed = batch.records.len();
            return outcome.failed(e.to_string());
        },
    }

    let groups = match plan_groups(form, fetcher.as_ref()).await {
        Ok(groups) => groups,
        Err(e) => {
            warn!(form_id = %form.id, error = %e, "Field tree unavailable, using declared repeat groups only");
            outcome.discovery_error = Some(e.to_string());
            discover_repeat_groups(&form.fields)
        },
    };
    if groups.is_empty() {
        return outcome;
    }

    let keys: Vec<(String, usize)> = batch
        .records
        .iter()
        .zip(&batch.sources)
        .filter_map(|(record, &source)| record.key_text(&form.unique_key).map(|key| (key, source)))
        .collect();
    let top_level: Vec<ParentRow<'_>> = keys
        .iter()
        .map(|(key, source)| ParentRow {
            key,
            record: &raws[*source],
        })
        .collect();

    let layout = fetcher.repeat_layout();
    let fetched = fetch_groups(form, fetcher.as_ref(), layout, &groups).await;

    let mut linked: Vec<Option<Vec<ParentLink>>> = Vec::with_capacity(groups.len());
    for (group, fetched) in groups.iter().zip(fetched) {
        if !group.declared {
            let target = form.group_target_name(&group.target_path);
            if let Err(owner) = claims.claim(&target, &form.id) {
                let error = format!("target '{}' shared with form '{}'", target, owner);
                error!(form_id = %form.id, group = %group.path_display(), error = %error, "Skipping undeclared group");
                outcome.groups.push(GroupOutcome {
                    path: group.path_display(),
                    target,
                    declared: false,
                    status: UnitStatus::Failed,
                    counts: RecordCounts::default(),
                    error: Some(error),
                    rejected: Vec::new(),
                });
                linked.push(None);
                continue;
            }
        }

        let (group_outcome, links) = process_group(form, group, fetched, &top_level, &linked, sink).await;
        outcome.groups.push(group_outcome);
        linked.push(links);
    }

    outcome
}

/// Repeat groups of a form in discovery order, including undeclared ones
/// when the form asks for them and the source can list them
async fn plan_groups(form: &FormDefinition, fetcher: &dyn RemoteFetcher) -> Result<Vec<RepeatGroup>, FetchError> {
    if !form.discover_repeat_groups {
        return Ok(discover_repeat_groups(&form.fields));
    }

    match fetcher.field_tree(&form.id).await? {
        Some(remote) => {
            let groups = discover_with_remote(&form.fields, &remote);
            let undeclared = groups.iter().filter(|g| !g.declared).count();
            if undeclared > 0 {
                info!(form_id = %form.id, undeclared, "Found repeat groups missing from configuration");
            }
            Ok(groups)
        },
        None => Ok(discover_repeat_groups(&form.fields)),
    }
}

/// Fetch every separately exported group at once; embedded groups need no fetch
async fn fetch_groups(
    form: &FormDefinition,
    fetcher: &dyn RemoteFetcher,
    layout: RepeatLayout,
    groups: &[RepeatGroup],
) -> Vec<Option<Result<FetchBatch, FetchError>>> {
    join_all(groups.iter().map(|group| async move {
        match layout {
            RepeatLayout::Separate => Some(fetcher.fetch_repeat_group(&form.id, group.name()).await),
            RepeatLayout::Embedded => None,
        }
    }))
    .await
}

async fn process_group(
    form: &FormDefinition,
    group: &RepeatGroup,
    fetched: Option<Result<FetchBatch, FetchError>>,
    top_level: &[ParentRow<'_>],
    linked: &[Option<Vec<ParentLink>>],
    sink: &dyn UpsertSink,
) -> (GroupOutcome, Option<Vec<ParentLink>>) {
    let mut outcome = GroupOutcome {
        path: group.path_display(),
        target: form.group_target_name(&group.target_path),
        declared: group.declared,
        status: UnitStatus::NoData,
        counts: RecordCounts::default(),
        error: None,
        rejected: Vec::new(),
    };
    let fail = |mut outcome: GroupOutcome, error: String| {
        outcome.status = UnitStatus::Failed;
        outcome.error = Some(error);
        (outcome, None)
    };

    let enclosing_rows: Vec<ParentRow<'_>>;
    let parents: &[ParentRow<'_>] = match group.enclosing {
        None => top_level,
        Some(index) => match linked.get(index) {
            Some(Some(links)) => {
                enclosing_rows = links
                    .iter()
                    .map(|l| ParentRow {
                        key: &l.key,
                        record: &l.record,
                    })
                    .collect();
                &enclosing_rows
            },
            _ => {
                warn!(form_id = %form.id, group = %outcome.path, "Skipping group, {}", ENCLOSING_UNAVAILABLE);
                return fail(outcome, ENCLOSING_UNAVAILABLE.to_string());
            },
        },
    };

    let (source, inferred): (GroupSource, Option<FieldSpec>) = match fetched {
        None => (GroupSource::Embedded, None),
        Some(Ok(batch)) => {
            let inferred = (!group.declared).then(|| inferred_group_spec(group, &batch.columns));
            (GroupSource::Separate(batch.records), inferred)
        },
        Some(Err(e)) => {
            error!(form_id = %form.id, group = %outcome.path, error = %e, "Repeat group fetch failed");
            return fail(outcome, e.to_string());
        },
    };
    let fields: &[FieldSpec] = match &inferred {
        Some(spec) => spec.children(),
        None => group.spec.children(),
    };

    let exported_rows = match &source {
        GroupSource::Separate(rows) => Some(rows.len()),
        GroupSource::Embedded => None,
    };
    let expansion = expand(group, source, parents);
    outcome.counts.fetched = exported_rows.unwrap_or(expansion.links.len() + expansion.malformed);
    let (links, duplicates) = dedupe_links(expansion.links);
    outcome.counts.dropped = expansion.orphans + expansion.malformed;
    outcome.counts.duplicates = duplicates;

    let records: Vec<_> = links.iter().map(|link| normalize_child(link, fields)).collect();
    if records.is_empty() {
        return (outcome, Some(links));
    }
    let target = UpsertTarget::for_group(form, group, fields);

    match sink.upsert(&target, &records).await {
        Ok(upserted) => {
            outcome.counts.upserted = upserted.succeeded;
            outcome.counts.failed = upserted.failed;
            outcome.rejected = upserted.details;
            outcome.status = UnitStatus::Succeeded;
            (outcome, Some(links))
        },
        Err(e) => {
            error!(form_id = %form.id, group = %outcome.path, target = %target.name, error = %e, "Upsert failed");
            outcome.counts.failed = records.len();
            fail(outcome, e.to_string())
        },
    }
}

async fn run_mirror(ona: &Arc<OnaFetcher>, sink: &dyn RawDocumentSink) -> Vec<FormOutcome> {
    let projects = match ona.list_projects().await {
        Ok(projects) => projects,
        Err(e) => {
            error!(error = %e, "Failed to list Ona projects");
            return vec![FormOutcome::new("projects", "").failed(e.to_string())];
        },
    };

    let mut outcomes = Vec::new();
    let fetcher: Arc<dyn RemoteFetcher> = Arc::clone(ona) as Arc<dyn RemoteFetcher>;

    for form in projects.iter().flat_map(|p| p.forms.iter().flatten()) {
        let form_id = form.formid.to_string();
        let mut outcome = FormOutcome::new(&form_id, &form.name);
        info!(form_id = %form_id, collection = %form.name, "Mirroring Ona form");

        let raws: Vec<RawRecord> = match record_stream(Arc::clone(&fetcher), form_id.clone()).try_collect().await {
            Ok(raws) => raws,
            Err(e) => {
                error!(form_id = %form_id, error = %e, "Fetch failed");
                outcomes.push(outcome.failed(e.to_string()));
                continue;
            },
        };
        outcome.counts.fetched = raws.len();
        if raws.is_empty() {
            outcomes.push(outcome);
            continue;
        }

        match sink.upsert_raw(&form.name, &raws).await {
            Ok(upserted) => {
                outcome.counts.upserted = upserted.succeeded;
                outcome.counts.failed = upserted.failed;
                outcome.rejected = upserted.details;
                outcome.status = UnitStatus::Succeeded;
                outcomes.push(outcome);
            },
            Err(e) => {
                error!(form_id = %form_id, collection = %form.name, error = %e, "Upsert failed");
                outcome.counts.failed = raws.len();
                outcomes.push(outcome.failed(e.to_string()));
            },
        }
    }

    outcomes
}
