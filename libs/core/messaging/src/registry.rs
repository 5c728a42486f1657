//! Lookup table from region names to the subjects that serve them.

use crate::subject;
use std::collections::BTreeMap;

/// Subjects belonging to one provisioned region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRoute {
    pub region: String,
    /// Consumer filter, `jobs.<region>.*`.
    pub filter_subject: String,
    /// Subject probe jobs are published on, `jobs.<region>.trace`.
    pub job_subject: String,
}

impl RegionRoute {
    fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            filter_subject: subject::region_filter(region),
            job_subject: subject::job_subject(region, subject::TRACE_JOB_KIND),
        }
    }
}

/// Regions workers exist for, built once from the stream's subject list.
///
/// A region resolves only if `jobs.<region>.*` is one of the provisioned
/// subjects. Everything else (the results subject, foreign subjects, malformed
/// region tokens) is ignored when the table is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionRegistry {
    routes: BTreeMap<String, RegionRoute>,
}

impl RegionRegistry {
    /// Build the table from provisioned stream subjects.
    pub fn from_subjects<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let routes = subjects
            .into_iter()
            .filter_map(|s| subject::region_of_filter(s.as_ref()).map(RegionRoute::new))
            .map(|route| (route.region.clone(), route))
            .collect();
        Self { routes }
    }

    /// Build the table from bare region names, skipping invalid tokens.
    pub fn from_regions<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_subjects(
            regions
                .into_iter()
                .map(|region| subject::region_filter(region.as_ref())),
        )
    }

    /// Route for `region`, if its `jobs.<region>.*` subject is provisioned.
    pub fn resolve(&self, region: &str) -> Option<&RegionRoute> {
        self.routes.get(region)
    }

    pub fn contains(&self, region: &str) -> bool {
        self.routes.contains_key(region)
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Subjects a stream needs to serve every region plus the results subject.
    pub fn stream_subjects(&self) -> Vec<String> {
        self.routes
            .values()
            .map(|route| route.filter_subject.clone())
            .chain(std::iter::once(subject::RESULTS_SUBJECT.to_string()))
            .collect()
    }
}
