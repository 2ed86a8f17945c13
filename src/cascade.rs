//! Cascading dependent-filter chains.
//!
//! A [`FilterChain`] holds an ordered list of selectors (branch, academic
//! year, class, ...) where each selector's options depend on everything
//! selected before it. The chain is a pure reducer: every operation mutates
//! the chain and hands back the [`Command`]s (fetches) the caller must issue.
//! Responses are fed back through `resolve_*` together with the generation
//! they were issued under; anything older than the current state of the
//! level is reported as [`Resolution::Stale`] and dropped.

use crate::api::ApiRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterField {
    Branch,
    AcademicYear,
    Class,
    Subject,
    Student,
}

impl FilterField {
    pub fn name(self) -> &'static str {
        match self {
            FilterField::Branch => "branch",
            FilterField::AcademicYear => "academicYear",
            FilterField::Class => "class",
            FilterField::Subject => "subject",
            FilterField::Student => "student",
        }
    }

    /// Query-string key used when this field constrains a request.
    pub fn query_key(self) -> &'static str {
        match self {
            FilterField::Branch => "branchId",
            FilterField::AcademicYear => "academicYearId",
            FilterField::Class => "classId",
            FilterField::Subject => "subjectId",
            FilterField::Student => "studentId",
        }
    }

    /// Endpoint serving this field's option list.
    pub fn options_path(self) -> &'static str {
        match self {
            FilterField::Branch => "/api/branches",
            FilterField::AcademicYear => "/api/academic-years",
            FilterField::Class => "/api/classes",
            FilterField::Subject => "/api/subjects",
            FilterField::Student => "/api/students",
        }
    }

    /// Accepts either the field name (`academicYear`) or its query key (`academicYearId`).
    pub fn parse(s: &str) -> Option<Self> {
        [
            FilterField::Branch,
            FilterField::AcademicYear,
            FilterField::Class,
            FilterField::Subject,
            FilterField::Student,
        ]
        .into_iter()
        .find(|f| f.name() == s || f.query_key() == s)
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionItem {
    pub id: i64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LoadState<T> {
    Idle,
    Loading { generation: u64 },
    Populated { data: T },
    Error { message: String },
}

impl<T> LoadState<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            LoadState::Populated { data } => Some(data),
            _ => None,
        }
    }

    fn pending_generation(&self) -> Option<u64> {
        match self {
            LoadState::Loading { generation } => Some(*generation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub field: FilterField,
    pub selected: Option<i64>,
    pub options: LoadState<Vec<OptionItem>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    FetchOptions {
        field: FilterField,
        generation: u64,
        request: ApiRequest,
    },
    FetchDataset {
        generation: u64,
        request: ApiRequest,
    },
}

impl Command {
    pub fn request(&self) -> &ApiRequest {
        match self {
            Command::FetchOptions { request, .. } | Command::FetchDataset { request, .. } => {
                request
            }
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            Command::FetchOptions { generation, .. } | Command::FetchDataset { generation, .. } => {
                *generation
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Applied,
    Stale,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CascadeError {
    #[error("a filter chain needs at least one field")]
    Empty,
    #[error("field {0} appears more than once in the chain")]
    DuplicateField(FilterField),
    #[error("field {0} is not part of this chain")]
    UnknownField(FilterField),
    #[error("{field} cannot be selected before {missing}")]
    UpstreamUnselected {
        field: FilterField,
        missing: FilterField,
    },
    #[error("{id} is not a valid {field} option")]
    InvalidOption { field: FilterField, id: i64 },
    #[error("{key} is set by the {field} selector, not as a parameter")]
    ReservedParam { key: String, field: FilterField },
}

#[derive(Debug, Clone)]
pub struct FilterChain {
    levels: Vec<Level>,
    dataset_path: String,
    params: Vec<(String, String)>,
    required_params: Vec<String>,
    dataset: LoadState<serde_json::Value>,
    generation: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSnapshot<'a> {
    pub generation: u64,
    pub complete: bool,
    pub levels: &'a [Level],
    pub params: serde_json::Map<String, serde_json::Value>,
    pub required_params: &'a [String],
    pub dataset_path: &'a str,
    pub dataset: &'a LoadState<serde_json::Value>,
}

impl FilterChain {
    /// Builds an empty chain and the fetch for the first level's options.
    pub fn new(
        fields: &[FilterField],
        dataset_path: impl Into<String>,
    ) -> Result<(Self, Vec<Command>), CascadeError> {
        if fields.is_empty() {
            return Err(CascadeError::Empty);
        }
        for (i, f) in fields.iter().enumerate() {
            if fields[..i].contains(f) {
                return Err(CascadeError::DuplicateField(*f));
            }
        }

        let mut chain = Self {
            levels: fields
                .iter()
                .map(|&field| Level {
                    field,
                    selected: None,
                    options: LoadState::Idle,
                })
                .collect(),
            dataset_path: dataset_path.into(),
            params: Vec::new(),
            required_params: Vec::new(),
            dataset: LoadState::Idle,
            generation: 0,
        };
        let first = chain.issue_options(0);
        Ok((chain, vec![first]))
    }

    /// Marks a non-cascading parameter (e.g. `startDate`) as required before the dataset loads.
    pub fn require_param(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.required_params.contains(&key) {
            self.required_params.push(key);
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.levels.iter().all(|l| l.selected.is_some())
            && self
                .required_params
                .iter()
                .all(|k| self.param(k).is_some())
    }

    /// The dataset request for the current selection, or `None` while anything required is empty.
    pub fn dataset_request(&self) -> Option<ApiRequest> {
        if !self.is_complete() {
            return None;
        }
        let mut req = ApiRequest::get(self.dataset_path.clone());
        for level in &self.levels {
            if let Some(id) = level.selected {
                req = req.with_query(level.field.query_key(), id);
            }
        }
        for (k, v) in &self.params {
            req = req.with_query(k.clone(), v.clone());
        }
        Some(req)
    }

    /// Selects (or clears, with `None`) the value of one selector.
    ///
    /// Everything downstream is cleared. Re-selecting the current value is a no-op.
    pub fn select(
        &mut self,
        field: FilterField,
        value: Option<i64>,
    ) -> Result<Vec<Command>, CascadeError> {
        let idx = self.index_of(field)?;
        if self.levels[idx].selected == value {
            return Ok(Vec::new());
        }
        if value.is_some() {
            if let Some(missing) = self.levels[..idx].iter().find(|l| l.selected.is_none()) {
                return Err(CascadeError::UpstreamUnselected {
                    field,
                    missing: missing.field,
                });
            }
        }
        if let (Some(id), Some(items)) = (value, self.levels[idx].options.data()) {
            if !items.iter().any(|o| o.id == id) {
                return Err(CascadeError::InvalidOption { field, id });
            }
        }

        self.generation += 1;
        self.levels[idx].selected = value;
        for level in &mut self.levels[idx + 1..] {
            level.selected = None;
            level.options = LoadState::Idle;
        }
        self.dataset = LoadState::Idle;

        let mut commands = Vec::new();
        if value.is_some() && idx + 1 < self.levels.len() {
            commands.push(self.issue_options(idx + 1));
        }
        commands.extend(self.issue_dataset());
        Ok(commands)
    }

    /// Sets or clears one non-cascading parameter.
    pub fn set_param(
        &mut self,
        key: &str,
        value: Option<String>,
    ) -> Result<Vec<Command>, CascadeError> {
        self.set_params(&[(key.to_string(), value)])
    }

    /// Applies several parameter changes as one state change (one dataset fetch at most).
    ///
    /// Keys owned by a selector in this chain (`classId`, ...) are rejected and nothing is applied.
    pub fn set_params(
        &mut self,
        changes: &[(String, Option<String>)],
    ) -> Result<Vec<Command>, CascadeError> {
        for (key, _) in changes {
            if let Some(level) = self.levels.iter().find(|l| l.field.query_key() == key) {
                return Err(CascadeError::ReservedParam {
                    key: key.clone(),
                    field: level.field,
                });
            }
        }
        let mut changed = false;
        for (key, value) in changes {
            let value = value.as_ref().filter(|v| !v.trim().is_empty());
            let pos = self.params.iter().position(|(k, _)| k == key);
            match (pos, value) {
                (Some(i), Some(v)) if self.params[i].1 != *v => {
                    self.params[i].1 = v.clone();
                    changed = true;
                }
                (Some(i), None) => {
                    self.params.remove(i);
                    changed = true;
                }
                (None, Some(v)) => {
                    self.params.push((key.clone(), v.clone()));
                    changed = true;
                }
                _ => {}
            }
        }
        if !changed {
            return Ok(Vec::new());
        }
        self.generation += 1;
        self.dataset = LoadState::Idle;
        Ok(self.issue_dataset().into_iter().collect())
    }

    /// Re-issues errored option lists whose upstream is selected, and the dataset when complete.
    ///
    /// With nothing to re-issue the chain is left untouched, generation included.
    pub fn reload(&mut self) -> Vec<Command> {
        let failed: Vec<usize> = (0..self.levels.len())
            .filter(|&idx| {
                self.levels[..idx].iter().all(|l| l.selected.is_some())
                    && matches!(self.levels[idx].options, LoadState::Error { .. })
            })
            .collect();
        if failed.is_empty() && !self.is_complete() {
            return Vec::new();
        }
        self.generation += 1;
        let mut commands: Vec<Command> = failed
            .into_iter()
            .map(|idx| self.issue_options(idx))
            .collect();
        commands.extend(self.issue_dataset());
        commands
    }

    pub fn resolve_options(
        &mut self,
        field: FilterField,
        generation: u64,
        result: Result<Vec<OptionItem>, String>,
    ) -> Result<Resolution, CascadeError> {
        let idx = self.index_of(field)?;
        let level = &mut self.levels[idx];
        if level.options.pending_generation() != Some(generation) {
            return Ok(Resolution::Stale);
        }
        level.options = match result {
            Ok(data) => LoadState::Populated { data },
            Err(message) => LoadState::Error { message },
        };
        Ok(Resolution::Applied)
    }

    pub fn resolve_dataset(
        &mut self,
        generation: u64,
        result: Result<serde_json::Value, String>,
    ) -> Resolution {
        if self.dataset.pending_generation() != Some(generation) {
            return Resolution::Stale;
        }
        self.dataset = match result {
            Ok(data) => LoadState::Populated { data },
            Err(message) => LoadState::Error { message },
        };
        Resolution::Applied
    }

    pub fn snapshot(&self) -> ChainSnapshot<'_> {
        ChainSnapshot {
            generation: self.generation,
            complete: self.is_complete(),
            levels: &self.levels,
            params: self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
            required_params: &self.required_params,
            dataset_path: &self.dataset_path,
            dataset: &self.dataset,
        }
    }

    fn index_of(&self, field: FilterField) -> Result<usize, CascadeError> {
        self.levels
            .iter()
            .position(|l| l.field == field)
            .ok_or(CascadeError::UnknownField(field))
    }

    fn issue_options(&mut self, idx: usize) -> Command {
        let mut request = ApiRequest::get(self.levels[idx].field.options_path());
        for upstream in &self.levels[..idx] {
            if let Some(id) = upstream.selected {
                request = request.with_query(upstream.field.query_key(), id);
            }
        }
        let generation = self.generation;
        let level = &mut self.levels[idx];
        level.options = LoadState::Loading { generation };
        Command::FetchOptions {
            field: level.field,
            generation,
            request,
        }
    }

    fn issue_dataset(&mut self) -> Option<Command> {
        let request = self.dataset_request()?;
        let generation = self.generation;
        self.dataset = LoadState::Loading { generation };
        Some(Command::FetchDataset {
            generation,
            request,
        })
    }
}

#[cfg(test)]
impl<T> LoadState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading { .. })
    }
}

#[cfg(test)]
impl FilterChain {
    pub fn selected(&self, field: FilterField) -> Option<i64> {
        self.levels
            .iter()
            .find(|l| l.field == field)
            .and_then(|l| l.selected)
    }

    pub fn options(&self, field: FilterField) -> Option<&LoadState<Vec<OptionItem>>> {
        self.levels
            .iter()
            .find(|l| l.field == field)
            .map(|l| &l.options)
    }

    pub fn dataset(&self) -> &LoadState<serde_json::Value> {
        &self.dataset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GRADEBOOK: [FilterField; 4] = [
        FilterField::Branch,
        FilterField::AcademicYear,
        FilterField::Class,
        FilterField::Subject,
    ];

    fn items(ids: &[i64]) -> Vec<OptionItem> {
        ids.iter()
            .map(|&id| OptionItem {
                id,
                label: format!("option {}", id),
            })
            .collect()
    }

    fn answer_options(chain: &mut FilterChain, commands: &[Command], ids: &[i64]) {
        for cmd in commands {
            if let Command::FetchOptions {
                field, generation, ..
            } = cmd
            {
                let r = chain
                    .resolve_options(*field, *generation, Ok(items(ids)))
                    .expect("resolve");
                assert_eq!(r, Resolution::Applied);
            }
        }
    }

    fn dataset_urls(commands: &[Command]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::FetchDataset { request, .. } => Some(request.url()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn new_chain_fetches_first_level_only() {
        let (chain, cmds) = FilterChain::new(&GRADEBOOK, "/api/grades/statistics").expect("chain");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].request().url(), "/api/branches");
        assert!(chain.options(FilterField::Branch).expect("level").is_loading());
        assert!(!chain.is_complete());
        assert!(chain.dataset_request().is_none());
    }

    #[test]
    fn chain_rejects_empty_and_duplicate_fields() {
        assert_eq!(
            FilterChain::new(&[], "/api/x").err(),
            Some(CascadeError::Empty)
        );
        assert_eq!(
            FilterChain::new(&[FilterField::Branch, FilterField::Branch], "/api/x").err(),
            Some(CascadeError::DuplicateField(FilterField::Branch))
        );
    }

    #[test]
    fn statistics_fetch_waits_for_every_selector() {
        let (mut chain, cmds) =
            FilterChain::new(&GRADEBOOK, "/api/grades/statistics").expect("chain");
        answer_options(&mut chain, &cmds, &[1]);

        let cmds = chain.select(FilterField::Branch, Some(1)).expect("branch");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].request().url(), "/api/academic-years?branchId=1");
        answer_options(&mut chain, &cmds, &[2]);

        let cmds = chain.select(FilterField::AcademicYear, Some(2)).expect("year");
        assert_eq!(
            cmds[0].request().url(),
            "/api/classes?branchId=1&academicYearId=2"
        );
        answer_options(&mut chain, &cmds, &[5]);

        let cmds = chain.select(FilterField::Class, Some(5)).expect("class");
        assert!(dataset_urls(&cmds).is_empty());
        assert_eq!(chain.selected(FilterField::Subject), None);
        answer_options(&mut chain, &cmds, &[3, 4]);

        let cmds = chain.select(FilterField::Subject, Some(3)).expect("subject");
        assert_eq!(
            dataset_urls(&cmds),
            vec!["/api/grades/statistics?branchId=1&academicYearId=2&classId=5&subjectId=3"]
        );
        assert!(chain.dataset().is_loading());
    }

    #[test]
    fn changing_upstream_clears_everything_below() {
        let (mut chain, cmds) =
            FilterChain::new(&GRADEBOOK, "/api/grades/statistics").expect("chain");
        answer_options(&mut chain, &cmds, &[1, 9]);
        for (field, id) in [
            (FilterField::Branch, 1),
            (FilterField::AcademicYear, 2),
            (FilterField::Class, 5),
            (FilterField::Subject, 3),
        ] {
            let cmds = chain.select(field, Some(id)).expect("select");
            answer_options(&mut chain, &cmds, &[1, 2, 3, 5, 9]);
        }
        assert!(chain.is_complete());

        let cmds = chain.select(FilterField::Branch, Some(9)).expect("reselect");
        assert_eq!(cmds.len(), 1);
        assert_eq!(chain.selected(FilterField::Branch), Some(9));
        for field in [FilterField::AcademicYear, FilterField::Class, FilterField::Subject] {
            assert_eq!(chain.selected(field), None, "{} still selected", field);
        }
        assert!(chain.options(FilterField::AcademicYear).expect("lvl").is_loading());
        assert_eq!(
            chain.options(FilterField::Class),
            Some(&LoadState::Idle)
        );
        assert_eq!(chain.options(FilterField::Subject), Some(&LoadState::Idle));
        assert_eq!(chain.dataset(), &LoadState::Idle);
    }

    #[test]
    fn clearing_a_selection_issues_no_fetches() {
        let (mut chain, cmds) = FilterChain::new(&GRADEBOOK, "/api/x").expect("chain");
        answer_options(&mut chain, &cmds, &[1]);
        let cmds = chain.select(FilterField::Branch, Some(1)).expect("branch");
        answer_options(&mut chain, &cmds, &[2]);
        chain.select(FilterField::AcademicYear, Some(2)).expect("year");

        let cmds = chain.select(FilterField::Branch, None).expect("clear");
        assert!(cmds.is_empty());
        assert_eq!(chain.selected(FilterField::AcademicYear), None);
        assert_eq!(chain.options(FilterField::AcademicYear), Some(&LoadState::Idle));
    }

    #[test]
    fn selection_requires_upstream_and_known_options() {
        let (mut chain, cmds) = FilterChain::new(&GRADEBOOK, "/api/x").expect("chain");
        assert_eq!(
            chain.select(FilterField::Class, Some(5)),
            Err(CascadeError::UpstreamUnselected {
                field: FilterField::Class,
                missing: FilterField::Branch
            })
        );
        answer_options(&mut chain, &cmds, &[1, 2]);
        assert_eq!(
            chain.select(FilterField::Branch, Some(7)),
            Err(CascadeError::InvalidOption {
                field: FilterField::Branch,
                id: 7
            })
        );
        assert_eq!(
            chain.select(FilterField::Student, Some(1)),
            Err(CascadeError::UnknownField(FilterField::Student))
        );
    }

    #[test]
    fn stale_option_responses_are_discarded() {
        let (mut chain, cmds) = FilterChain::new(&GRADEBOOK, "/api/x").expect("chain");
        answer_options(&mut chain, &cmds, &[1, 2]);

        let first = chain.select(FilterField::Branch, Some(1)).expect("b1");
        let second = chain.select(FilterField::Branch, Some(2)).expect("b2");

        // Newer response lands first, older one arrives late.
        let r = chain
            .resolve_options(FilterField::AcademicYear, second[0].generation(), Ok(items(&[20])))
            .expect("resolve");
        assert_eq!(r, Resolution::Applied);
        let r = chain
            .resolve_options(FilterField::AcademicYear, first[0].generation(), Ok(items(&[10])))
            .expect("resolve");
        assert_eq!(r, Resolution::Stale);

        let opts = chain
            .options(FilterField::AcademicYear)
            .and_then(|s| s.data())
            .expect("populated");
        assert_eq!(opts, &items(&[20]));
    }

    #[test]
    fn stale_dataset_response_cannot_overwrite_newer_one() {
        let (mut chain, cmds) =
            FilterChain::new(&[FilterField::Branch], "/api/attendance").expect("chain");
        chain.require_param("startDate");
        answer_options(&mut chain, &cmds, &[1]);
        assert!(chain.select(FilterField::Branch, Some(1)).expect("b").is_empty());

        let old = chain
            .set_param("startDate", Some("2026-01-01".into()))
            .expect("param");
        let new = chain
            .set_param("startDate", Some("2026-02-01".into()))
            .expect("param");
        assert_eq!(
            dataset_urls(&new),
            vec!["/api/attendance?branchId=1&startDate=2026-02-01"]
        );

        assert_eq!(
            chain.resolve_dataset(old[0].generation(), Ok(json!({ "rows": 1 }))),
            Resolution::Stale
        );
        assert!(chain.dataset().is_loading());
        assert_eq!(
            chain.resolve_dataset(new[0].generation(), Ok(json!({ "rows": 2 }))),
            Resolution::Applied
        );
        assert_eq!(chain.dataset().data(), Some(&json!({ "rows": 2 })));
    }

    #[test]
    fn failed_fetch_leaves_error_state_until_reload() {
        let (mut chain, cmds) =
            FilterChain::new(&[FilterField::Branch], "/api/exams").expect("chain");
        chain
            .resolve_options(FilterField::Branch, cmds[0].generation(), Err("offline".into()))
            .expect("resolve");
        assert_eq!(
            chain.options(FilterField::Branch),
            Some(&LoadState::Error {
                message: "offline".into()
            })
        );

        let before = chain.snapshot().generation;
        let cmds = chain.reload();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].request().url(), "/api/branches");
        assert_eq!(chain.snapshot().generation, before + 1);
    }

    #[test]
    fn reload_on_an_incomplete_healthy_chain_does_nothing() {
        let (mut chain, cmds) = FilterChain::new(&GRADEBOOK, "/api/x").expect("chain");
        answer_options(&mut chain, &cmds, &[1]);
        let cmds = chain.select(FilterField::Branch, Some(1)).expect("branch");
        answer_options(&mut chain, &cmds, &[2]);

        let before = chain.snapshot().generation;
        assert!(chain.reload().is_empty());
        assert_eq!(chain.snapshot().generation, before);
        assert_eq!(chain.dataset(), &LoadState::Idle);
    }

    #[test]
    fn reload_on_a_complete_chain_refetches_the_dataset() {
        let (mut chain, cmds) =
            FilterChain::new(&[FilterField::Class], "/api/exams").expect("chain");
        answer_options(&mut chain, &cmds, &[5]);
        let first = chain.select(FilterField::Class, Some(5)).expect("class");
        let cmds = chain.reload();
        assert_eq!(dataset_urls(&cmds), vec!["/api/exams?classId=5"]);
        assert_eq!(
            chain.resolve_dataset(first[0].generation(), Ok(json!([]))),
            Resolution::Stale
        );
    }

    #[test]
    fn selector_keys_cannot_be_set_as_params() {
        let (mut chain, cmds) =
            FilterChain::new(&GRADEBOOK, "/api/grades/statistics").expect("chain");
        answer_options(&mut chain, &cmds, &[1, 2, 3, 5]);
        for (field, id) in [
            (FilterField::Branch, 1),
            (FilterField::AcademicYear, 2),
            (FilterField::Class, 5),
            (FilterField::Subject, 3),
        ] {
            let cmds = chain.select(field, Some(id)).expect("select");
            answer_options(&mut chain, &cmds, &[1, 2, 3, 5]);
        }
        let before = chain.snapshot().generation;

        assert_eq!(
            chain.set_param("subjectId", Some("9".into())),
            Err(CascadeError::ReservedParam {
                key: "subjectId".into(),
                field: FilterField::Subject
            })
        );
        assert_eq!(
            chain
                .set_params(&[
                    ("status".into(), Some("archived".into())),
                    ("classId".into(), None),
                ])
                .err(),
            Some(CascadeError::ReservedParam {
                key: "classId".into(),
                field: FilterField::Class
            })
        );
        assert_eq!(chain.param("status"), None);
        assert_eq!(chain.snapshot().generation, before);
        assert_eq!(
            chain.dataset_request().map(|r| r.url()),
            Some("/api/grades/statistics?branchId=1&academicYearId=2&classId=5&subjectId=3".to_string())
        );

        // Keys of fields outside the chain stay ordinary params.
        let cmds = chain
            .set_param("studentId", Some("10".into()))
            .expect("param");
        assert_eq!(
            dataset_urls(&cmds),
            vec!["/api/grades/statistics?branchId=1&academicYearId=2&classId=5&subjectId=3&studentId=10"]
        );
    }

    #[test]
    fn batched_params_issue_a_single_dataset_fetch() {
        let (mut chain, cmds) =
            FilterChain::new(&[FilterField::Class], "/api/attendance").expect("chain");
        chain.require_param("startDate");
        chain.require_param("endDate");
        answer_options(&mut chain, &cmds, &[5]);
        chain.select(FilterField::Class, Some(5)).expect("class");

        let cmds = chain
            .set_params(&[
                ("startDate".into(), Some("2026-10-19".into())),
                ("endDate".into(), Some("2026-10-25".into())),
            ])
            .expect("params");
        assert_eq!(
            dataset_urls(&cmds),
            vec!["/api/attendance?classId=5&startDate=2026-10-19&endDate=2026-10-25"]
        );
        assert!(chain
            .set_params(&[("endDate".into(), Some("2026-10-25".into()))])
            .expect("params")
            .is_empty());
    }
}
