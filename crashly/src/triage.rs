//! Groups many crash reports into failure signatures and ranks them.
//!
//! Buckets are keyed by (version, signature); merging two aggregators is a
//! plain set union, so batch processing order never affects membership or
//! counts, only the documented display sort breaks ties.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};

use regex::Regex;
use rustc_hash::FxHashMap;
use serde_derive::Serialize;

use crate::extract::CrashReport;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriageKey {
    pub version: String,
    pub signature: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct TriageBucket {
    pub report_paths: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct TriageOptions {
    /// Offending-function ranking length.
    pub top_functions: usize,
    /// Report paths listed per bucket.
    pub paths_per_bucket: usize,
    /// Buckets below this share stop the enumeration...
    pub noise_threshold_percent: f64,
    /// ...once cumulative coverage has reached this much.
    pub coverage_target_percent: f64,
}

impl Default for TriageOptions {
    fn default() -> Self {
        Self {
            top_functions: 10,
            paths_per_bucket: 5,
            noise_threshold_percent: 1.0,
            coverage_target_percent: 80.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct TriageAggregator {
    buckets: FxHashMap<TriageKey, TriageBucket>,
    matches: usize,
}

#[derive(Debug, Serialize)]
pub struct TriageSummary {
    pub total_matches: usize,
    pub versions: Vec<VersionSummary>,
}

#[derive(Debug, Serialize)]
pub struct VersionSummary {
    pub version: String,
    pub total_reports: usize,
    pub total_sources: usize,
    pub top_functions: Vec<FunctionShare>,
    pub buckets: Vec<BucketSummary>,
}

#[derive(Debug, Serialize)]
pub struct FunctionShare {
    pub name: String,
    /// Distinct buckets the function appears in.
    pub buckets: usize,
    /// Reports covered by those buckets.
    pub reports: usize,
}

#[derive(Debug, Serialize)]
pub struct BucketSummary {
    pub signature: Vec<String>,
    pub reports: usize,
    pub sources: usize,
    pub share_percent: f64,
    /// Descending; the head doubles as the display sample.
    pub report_paths: Vec<String>,
}

impl TriageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self) -> usize {
        self.matches
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// `version` is the effective (post-fuzzy-substitution) report version.
    pub fn add(&mut self, version: String, report: &CrashReport) {
        self.matches += 1;
        let key = TriageKey {
            version,
            signature: report.signature.clone(),
        };
        self.buckets
            .entry(key)
            .or_default()
            .report_paths
            .insert(report.path.clone());
    }

    /// Commutative bucket union.
    pub fn merge(&mut self, other: TriageAggregator) {
        self.matches += other.matches;
        for (key, bucket) in other.buckets {
            self.buckets
                .entry(key)
                .or_default()
                .report_paths
                .extend(bucket.report_paths);
        }
    }

    pub fn summary(&self) -> TriageSummary {
        let source_re = Regex::new(r"_((?:[0-9]{1,3}\.){4})txt(?:\.gz)?$").unwrap();

        let mut by_version: BTreeMap<&str, Vec<(&TriageKey, &TriageBucket)>> = BTreeMap::new();
        for (key, bucket) in &self.buckets {
            by_version
                .entry(key.version.as_str())
                .or_default()
                .push((key, bucket));
        }

        let mut versions = Vec::new();
        for (version, buckets) in by_version.into_iter().rev() {
            let total_reports: usize = buckets.iter().map(|(_, b)| b.report_paths.len()).sum();
            let total_sources: usize = buckets
                .iter()
                .map(|(_, b)| count_sources(&b.report_paths, &source_re))
                .sum();

            let mut function_stats: FxHashMap<&str, (usize, usize)> = FxHashMap::default();
            for (key, bucket) in &buckets {
                let distinct: BTreeSet<&str> = key.signature.iter().map(String::as_str).collect();
                for name in distinct {
                    let stats = function_stats.entry(name).or_default();
                    stats.0 += 1;
                    stats.1 += bucket.report_paths.len();
                }
            }
            let mut top_functions: Vec<FunctionShare> = function_stats
                .into_iter()
                .map(|(name, (buckets, reports))| FunctionShare {
                    name: name.to_string(),
                    buckets,
                    reports,
                })
                .collect();
            top_functions.sort_by(|a, b| {
                b.buckets
                    .cmp(&a.buckets)
                    .then_with(|| b.reports.cmp(&a.reports))
                    .then_with(|| a.name.cmp(&b.name))
            });
            let mut bucket_summaries: Vec<BucketSummary> = buckets
                .iter()
                .map(|(key, bucket)| {
                    let mut report_paths: Vec<String> =
                        bucket.report_paths.iter().cloned().collect();
                    report_paths.reverse();
                    BucketSummary {
                        signature: key.signature.clone(),
                        reports: bucket.report_paths.len(),
                        sources: count_sources(&bucket.report_paths, &source_re),
                        share_percent: 100.0 * bucket.report_paths.len() as f64
                            / total_reports.max(1) as f64,
                        report_paths,
                    }
                })
                .collect();
            // Count descending; ties go to the greatest report path.
            bucket_summaries.sort_by(|a, b| {
                b.reports.cmp(&a.reports).then_with(|| {
                    b.report_paths
                        .first()
                        .cmp(&a.report_paths.first())
                })
            });

            versions.push(VersionSummary {
                version: version.to_string(),
                total_reports,
                total_sources,
                top_functions,
                buckets: bucket_summaries,
            });
        }

        TriageSummary {
            total_matches: self.matches,
            versions,
        }
    }

    pub fn render(&self, out: &mut dyn Write, options: &TriageOptions) -> io::Result<()> {
        let mut summary = self.summary();
        for version in &mut summary.versions {
            version.top_functions.truncate(options.top_functions);
        }

        for version in &summary.versions {
            writeln!(
                out,
                "============= {} ({} total logs, {} total ips) ================",
                version.version, version.total_reports, version.total_sources
            )?;
            let ranking_is_informative = version.top_functions.len() > 1
                && version.top_functions.iter().any(|f| f.reports > 1);
            if ranking_is_informative {
                for share in &version.top_functions {
                    writeln!(
                        out,
                        "{} logs in {} stacks. {} ({:.0}%)",
                        share.reports,
                        share.buckets,
                        share.name,
                        100.0 * share.reports as f64 / version.total_reports.max(1) as f64
                    )?;
                }
            }
            writeln!(out)?;

            let mut printed_percent = 0.0;
            for bucket in &version.buckets {
                let mut stack_text = if bucket.signature.is_empty() {
                    "<no stack>".to_string()
                } else {
                    bucket.signature.join(" <- ")
                };
                if stack_text.len() > 100 {
                    stack_text = bucket.signature.join("\n   <- ");
                }
                let sources_text = if version.total_sources > 0 {
                    format!(
                        " logs {}({:.1}%) ips",
                        bucket.sources,
                        100.0 * bucket.sources as f64 / version.total_sources as f64
                    )
                } else {
                    String::new()
                };
                writeln!(
                    out,
                    "{}({:.1}%){}. {}",
                    bucket.reports, bucket.share_percent, sources_text, stack_text
                )?;
                for path in bucket.report_paths.iter().take(options.paths_per_bucket) {
                    writeln!(out, "      {path}")?;
                }
                if bucket.report_paths.len() > options.paths_per_bucket {
                    writeln!(out, "    ...")?;
                }
                printed_percent += bucket.share_percent;
                if bucket.share_percent < options.noise_threshold_percent
                    && printed_percent > options.coverage_target_percent
                {
                    writeln!(
                        out,
                        "stopping - below noise threshold ({:.1}%) ignored",
                        100.0 - printed_percent
                    )?;
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Distinct originating machines, recovered from the `_a.b.c.d.txt[.gz]`
/// upload naming convention. Zero when the batch does not use it.
fn count_sources(paths: &BTreeSet<String>, source_re: &Regex) -> usize {
    let mut sources = BTreeSet::new();
    for path in paths {
        if let Some(caps) = source_re.captures(path) {
            sources.insert(caps[1].to_string());
        }
    }
    sources.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashly_symbols::{BuildDate, ModuleMap};

    fn report(path: &str, version: &str, signature: &[&str]) -> (String, CrashReport) {
        (
            version.to_string(),
            CrashReport {
                path: path.to_string(),
                version: version.to_string(),
                platform: "App".to_string(),
                build_config: "Release64".to_string(),
                build_date: BuildDate::parse_version(version).unwrap(),
                modules: ModuleMap::new(),
                frames: Vec::new(),
                has_application_frame: true,
                cause: None,
                signature: signature.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    fn add(aggregator: &mut TriageAggregator, path: &str, version: &str, signature: &[&str]) {
        let (version, report) = report(path, version, signature);
        aggregator.add(version, &report);
    }

    #[test]
    fn same_signature_same_version_is_one_bucket() {
        let mut aggregator = TriageAggregator::new();
        add(&mut aggregator, "a.txt", "2024_01_01", &["parseShip", "loadLevel"]);
        add(&mut aggregator, "b.txt", "2024_01_01", &["parseShip", "loadLevel"]);
        add(&mut aggregator, "c.txt", "2024_01_01", &["other"]);
        assert_eq!(aggregator.bucket_count(), 2);
        let summary = aggregator.summary();
        let version = &summary.versions[0];
        assert_eq!(version.total_reports, 3);
        assert_eq!(version.buckets[0].reports, 2);
        assert_eq!(
            version.buckets[0].signature,
            vec!["parseShip", "loadLevel"]
        );
    }

    #[test]
    fn merge_is_order_independent() {
        let logs: [(&str, &str, &[&str]); 4] = [
            ("a.txt", "2024_01_01", &["f", "g"]),
            ("b.txt", "2024_01_01", &["f", "g"]),
            ("c.txt", "2024_01_01", &["h"]),
            ("d.txt", "2023_12_01", &["f"]),
        ];

        let mut forward = TriageAggregator::new();
        for (path, version, signature) in logs {
            add(&mut forward, path, version, signature);
        }

        let mut reversed = TriageAggregator::new();
        for (path, version, signature) in logs.into_iter().rev() {
            let mut single = TriageAggregator::new();
            add(&mut single, path, version, signature);
            reversed.merge(single);
        }

        assert_eq!(forward.matches(), reversed.matches());
        let a = forward.summary();
        let b = reversed.summary();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn versions_are_listed_newest_first() {
        let mut aggregator = TriageAggregator::new();
        add(&mut aggregator, "a.txt", "2023_12_01", &["f"]);
        add(&mut aggregator, "b.txt", "2024_01_01", &["f"]);
        let summary = aggregator.summary();
        assert_eq!(summary.versions[0].version, "2024_01_01");
        assert_eq!(summary.versions[1].version, "2023_12_01");
    }

    #[test]
    fn function_ranking_counts_distinct_buckets() {
        let mut aggregator = TriageAggregator::new();
        add(&mut aggregator, "a.txt", "2024_01_01", &["f", "g"]);
        add(&mut aggregator, "b.txt", "2024_01_01", &["f", "g"]);
        add(&mut aggregator, "c.txt", "2024_01_01", &["f", "h"]);
        let summary = aggregator.summary();
        let top = &summary.versions[0].top_functions;
        assert_eq!(top[0].name, "f");
        assert_eq!(top[0].buckets, 2);
        assert_eq!(top[0].reports, 3);
    }

    #[test]
    fn source_identities_are_distinct_per_bucket() {
        let mut aggregator = TriageAggregator::new();
        add(
            &mut aggregator,
            "crash/20240102_10.1.2.3.txt.gz",
            "2024_01_01",
            &["f"],
        );
        add(
            &mut aggregator,
            "crash/20240103_10.1.2.3.txt.gz",
            "2024_01_01",
            &["f"],
        );
        add(
            &mut aggregator,
            "crash/20240104_10.9.9.9.txt.gz",
            "2024_01_01",
            &["f"],
        );
        let summary = aggregator.summary();
        assert_eq!(summary.versions[0].buckets[0].reports, 3);
        assert_eq!(summary.versions[0].buckets[0].sources, 2);
    }

    #[test]
    fn rendering_applies_the_noise_cutoff() {
        let mut aggregator = TriageAggregator::new();
        for i in 0..99 {
            add(
                &mut aggregator,
                &format!("big{i}.txt"),
                "2024_01_01",
                &["hot"],
            );
        }
        for i in 0..5 {
            add(
                &mut aggregator,
                &format!("rare{i}.txt"),
                "2024_01_01",
                &[&format!("cold{i}")],
            );
        }
        let mut out = Vec::new();
        aggregator
            .render(&mut out, &TriageOptions::default())
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("stopping - below noise threshold"), "{text}");
        assert!(text.contains("99(95.2%)"), "{text}");
    }

    #[test]
    fn empty_signature_renders_as_no_stack() {
        let mut aggregator = TriageAggregator::new();
        add(&mut aggregator, "a.txt", "2024_01_01", &[]);
        let mut out = Vec::new();
        aggregator
            .render(&mut out, &TriageOptions::default())
            .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("<no stack>"));
    }
}
