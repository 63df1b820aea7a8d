//! Cursors over query results.

use crate::error::Result;
use crate::export::{self, ExportPath};
use crate::job::Job;
use crate::project::Project;
use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use signac_ids::{canonical_json, JobId};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// An iterator-like view over the jobs matching a filter.
///
/// The filter is evaluated lazily the first time the ids are needed; the
/// resulting id list and id set are cached for the lifetime of the cursor.
/// Re-run [`Project::find_jobs`] after modifying the workspace to refresh
/// the result.
pub struct JobsCursor<'a> {
    project: &'a Project,
    filter: Option<Map<String, Value>>,
    ids: OnceCell<Vec<JobId>>,
    id_set: OnceCell<HashSet<JobId>>,
}

impl<'a> JobsCursor<'a> {
    pub(crate) fn new(project: &'a Project, filter: Option<Map<String, Value>>) -> Self {
        Self {
            project,
            filter,
            ids: OnceCell::new(),
            id_set: OnceCell::new(),
        }
    }

    /// The matching job ids, evaluated on first use.
    pub fn job_ids(&self) -> Result<&[JobId]> {
        self.ids
            .get_or_try_init(|| self.project.find_job_ids(self.filter.as_ref()))
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.job_ids()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.job_ids()?.is_empty())
    }

    /// Whether a job matches this cursor's filter.
    pub fn contains(&self, job: &Job<'_>) -> Result<bool> {
        if self.filter.is_none() {
            return Ok(self.project.contains(job));
        }
        let set = self
            .id_set
            .get_or_try_init(|| -> Result<HashSet<JobId>> {
                Ok(self.job_ids()?.iter().cloned().collect::<HashSet<_>>())
            })?;
        Ok(set.contains(job.id()))
    }

    /// Iterate over the matching jobs as freshly constructed handles.
    pub fn iter(&self) -> Result<impl Iterator<Item = Job<'a>>> {
        let project = self.project;
        let ids = self.job_ids()?.to_vec();
        Ok(ids.into_iter().map(move |id| Job::new(project, id)))
    }

    /// Group the matching jobs by one state point or document key.
    ///
    /// Keys prefixed with `doc.` read the job document; `sp.` or no prefix
    /// reads the state point. Without a `default`, jobs missing the key
    /// are filtered out.
    pub fn group_by(
        &self,
        key: &str,
        default: Option<Value>,
    ) -> Result<Vec<(Value, Vec<Job<'a>>)>> {
        self.group_with(|job| Self::key_value(job, key, default.as_ref()))
    }

    /// Group by multiple keys; the group key is the list of values.
    pub fn group_by_keys(
        &self,
        keys: &[&str],
        default: Option<Value>,
    ) -> Result<Vec<(Value, Vec<Job<'a>>)>> {
        self.group_with(|job| {
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                match Self::key_value(job, key, default.as_ref())? {
                    Some(value) => values.push(value),
                    None => return Ok(None),
                }
            }
            Ok(Some(Value::Array(values)))
        })
    }

    /// Group using an arbitrary key function. Jobs for which the function
    /// returns `None` are filtered out.
    pub fn group_with<F>(&self, key_fn: F) -> Result<Vec<(Value, Vec<Job<'a>>)>>
    where
        F: Fn(&Job<'a>) -> Result<Option<Value>>,
    {
        let mut keyed: Vec<(Value, Job<'a>)> = Vec::new();
        for job in self.iter()? {
            if let Some(key) = key_fn(&job)? {
                keyed.push((key, job));
            }
        }
        keyed.sort_by(|(a, job_a), (b, job_b)| {
            cmp_values(a, b).then_with(|| job_a.id().cmp(job_b.id()))
        });

        let mut groups: Vec<(Value, Vec<Job<'a>>)> = Vec::new();
        for (key, job) in keyed {
            match groups.last_mut() {
                Some((current, jobs)) if *current == key => jobs.push(job),
                _ => groups.push((key, vec![job])),
            }
        }
        Ok(groups)
    }

    fn key_value(job: &Job<'_>, key: &str, default: Option<&Value>) -> Result<Option<Value>> {
        let (namespace, stripped) = match key.split_once('.') {
            Some(("doc", rest)) => ("doc", rest),
            Some(("sp", rest)) => ("sp", rest),
            _ => ("sp", key),
        };
        let value = if namespace == "doc" {
            lookup_path(&Value::Object(job.document()?.to_map()?), stripped)
        } else {
            lookup_path(&Value::Object(job.statepoint()?), stripped)
        };
        Ok(value.or_else(|| default.cloned()))
    }

    /// Export the matching jobs to a directory or archive.
    pub fn export_to(
        &self,
        target: impl AsRef<Path>,
        path_spec: ExportPath,
    ) -> Result<Vec<(PathBuf, String)>> {
        let jobs: Vec<Job<'a>> = self.iter()?.collect();
        export::export_jobs(&jobs, target.as_ref(), path_spec)
    }
}

fn lookup_path(root: &Value, dotted: &str) -> Option<Value> {
    let mut current = root;
    for node in dotted.split('.') {
        current = current.as_object()?.get(node)?;
    }
    Some(current.clone())
}

/// Order group keys naturally within one JSON kind, with a stable textual
/// fallback across kinds.
pub(crate) fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => canonical_json(a).cmp(&canonical_json(b)),
    }
}

impl std::fmt::Debug for JobsCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobsCursor")
            .field("project", &self.project.path())
            .field("filter", &self.filter)
            .finish()
    }
}
