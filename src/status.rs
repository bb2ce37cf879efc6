//! Collection progress report.
//!
//! Summarizes what the progress documents say: how many archives each
//! domain is finished in, and how far along the unfinished ones are. Used by
//! `ccc status` to check on a long-running collection without touching the
//! network.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::catalog::ArchiveCatalog;
use crate::config::{load_domains, Config};
use crate::notify::format_number;
use crate::progress::{DomainProgress, ProgressStore};

/// Progress of one domain across all archives it has history for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    pub domain: String,
    pub completed_archives: usize,
    /// Archives started but not finished, in archive-ID order.
    pub partial: Vec<(String, DomainProgress)>,
}

/// `None` when the domain has no recorded history.
pub fn domain_status(progress: &mut ProgressStore, domain: &str) -> Option<DomainStatus> {
    let history = progress.load(domain);
    if history.is_empty() {
        return None;
    }
    let mut status = DomainStatus {
        domain: domain.to_string(),
        completed_archives: 0,
        partial: Vec::new(),
    };
    for (archive_id, p) in history {
        if p.is_done() {
            status.completed_archives += 1;
        } else {
            status.partial.push((archive_id.clone(), *p));
        }
    }
    Some(status)
}

/// Totals across every configured domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub total_domains: usize,
    pub completed_domains: usize,
    /// Domains with some but not all archives done, with their done count.
    pub partial_domains: Vec<(String, usize)>,
    pub completed_archives: usize,
    pub partial_archives: usize,
}

pub fn summarize<'a>(
    progress: &mut ProgressStore,
    domains: impl IntoIterator<Item = &'a str>,
    archive_count: usize,
) -> Summary {
    let mut summary = Summary::default();
    for domain in domains {
        summary.total_domains += 1;
        let Some(status) = domain_status(progress, domain) else {
            continue;
        };
        summary.completed_archives += status.completed_archives;
        summary.partial_archives += status.partial.len();
        if archive_count > 0 && status.completed_archives >= archive_count {
            summary.completed_domains += 1;
        } else {
            summary.partial_domains
                .push((domain.to_string(), status.completed_archives));
        }
    }
    summary
}

pub fn render_domain(status: &DomainStatus, archive_count: usize) -> String {
    let mut out = format!(
        "{} has been fully processed in {}/{} archives (+{} in progress).\n",
        status.domain,
        status.completed_archives,
        archive_count,
        status.partial.len()
    );
    for (archive_id, p) in &status.partial {
        match p.results {
            Some(results) => out.push_str(&format!(
                "  {}: {}/{} ({:.1}%) results downloaded, {} failed.\n",
                archive_id,
                format_number(p.completed),
                format_number(results),
                100.0 * p.completed as f64 / results as f64,
                format_number(p.failed)
            )),
            None => out.push_str(&format!("  {}: not searched yet.\n", archive_id)),
        }
    }
    out
}

pub fn render_summary(summary: &Summary, archive_count: usize) -> String {
    let mut out = format!(
        "{}/{} domains have been fully processed, and {} have been partially processed.\n",
        summary.completed_domains,
        summary.total_domains,
        summary.partial_domains.len()
    );
    if summary.total_domains > 0 {
        out.push_str(&format!(
            "On average {:.1}/{} archives are done per domain; {} archives are in progress.\n",
            summary.completed_archives as f64 / summary.total_domains as f64,
            archive_count,
            summary.partial_archives
        ));
    }
    if !summary.partial_domains.is_empty() {
        let list: Vec<String> = summary
            .partial_domains
            .iter()
            .map(|(domain, done)| format!("{} ({}/{})", domain, done, archive_count))
            .collect();
        out.push_str(&format!(
            "Partially processed domains (done/total archives): {}\n",
            list.join(", ")
        ));
    }
    out
}

/// Run the status command: read local state only and print a report.
pub fn run_status(config: &Config, domain: Option<&str>) -> Result<()> {
    let catalog = ArchiveCatalog::load(config.paths.catalog_file());
    let archive_count = catalog.len();
    let domains = load_domains(&config.paths.domains)?;
    let mut progress = ProgressStore::new(&config.paths.history_dir, &domains);

    match domain {
        Some(domain) => match domain_status(&mut progress, domain) {
            Some(status) => print!("{}", render_domain(&status, archive_count)),
            None => println!("No history found for {}", domain),
        },
        None => {
            let names: Vec<&str> = domains.iter().map(|d| d.domain()).collect();
            let summary = summarize(&mut progress, names, archive_count);
            print!("{}", render_summary(&summary, archive_count));
        }
    }

    let refreshed = match catalog.updated_at() {
        Some(ts) => format_ts_relative(ts, Utc::now()),
        None => "never".to_string(),
    };
    println!("Archive catalog: {} archives, refreshed {}.", archive_count, refreshed);
    Ok(())
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
fn format_ts_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainKey;
    use crate::progress::ProgressField;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> ProgressStore {
        let domains = vec![
            DomainKey::new("example.com").unwrap(),
            DomainKey::new("liu.se").unwrap(),
        ];
        let mut progress = ProgressStore::new(tmp.path().join("history"), &domains);
        let set = |p: &mut ProgressStore, d: &str, a: &str, f: ProgressField, v: u64| {
            p.record_result(d, a, f, v).unwrap();
        };
        set(&mut progress, "example.com", "A", ProgressField::Results, 0);
        set(&mut progress, "example.com", "B", ProgressField::Results, 4);
        set(&mut progress, "example.com", "B", ProgressField::Completed, 1);
        set(&mut progress, "example.com", "B", ProgressField::Failed, 1);
        set(&mut progress, "liu.se", "A", ProgressField::Results, 2);
        set(&mut progress, "liu.se", "A", ProgressField::Completed, 2);
        set(&mut progress, "liu.se", "B", ProgressField::Results, 0);
        progress
    }

    #[test]
    fn test_domain_status_and_render() {
        let tmp = TempDir::new().unwrap();
        let mut progress = store(&tmp);
        let status = domain_status(&mut progress, "example.com").unwrap();
        assert_eq!(status.completed_archives, 1);
        assert_eq!(status.partial.len(), 1);

        let text = render_domain(&status, 2);
        assert!(text.starts_with("example.com has been fully processed in 1/2 archives (+1 in progress)."));
        assert!(text.contains("B: 1/4 (25.0%) results downloaded, 1 failed."));

        assert!(domain_status(&mut progress, "unknown.org").is_none());
    }

    #[test]
    fn test_summary_counts_domains() {
        let tmp = TempDir::new().unwrap();
        let mut progress = store(&tmp);
        let summary = summarize(&mut progress, ["example.com", "liu.se", "new.org"], 2);
        assert_eq!(summary.total_domains, 3);
        assert_eq!(summary.completed_domains, 1);
        assert_eq!(summary.partial_domains, vec![("example.com".to_string(), 1)]);
        assert_eq!(summary.completed_archives, 3);
        assert_eq!(summary.partial_archives, 1);

        let text = render_summary(&summary, 2);
        assert!(text.contains("1/3 domains have been fully processed"));
        assert!(text.contains("example.com (1/2)"));
    }

    #[test]
    fn test_relative_time() {
        let now = Utc::now();
        assert_eq!(format_ts_relative(now, now), "just now");
        assert_eq!(format_ts_relative(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(format_ts_relative(now - Duration::days(1), now), "1 day ago");
    }
}
