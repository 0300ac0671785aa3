//! Page command implementation.

use meshdb_codec::Encode;
use meshdb_core::{
    ContinueToken, CursorConfig, DataSizeSpec, SyncDataReader, SyncPage, SyncQuery, SyncTimeRange,
};
use meshdb_storage::{DataFlags, MemoryStore, Timestamp};
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;

const ALL_TIME: Timestamp = i64::MAX as Timestamp;

/// What to generate and how to page it.
pub struct PageOptions {
    /// Records written as `k{i}` -> `v{i}`.
    pub records: usize,
    /// Indices deleted after all writes.
    pub deleted: Range<usize>,
    /// Byte budget per page.
    pub block_size: usize,
    /// Item budget per page.
    pub packet_size: usize,
    /// Key prefix of a query sync.
    pub query: Option<String>,
    /// Value filter of a query sync.
    pub value_contains: Option<String>,
}

/// One page as reported.
#[derive(Debug, Serialize)]
pub struct PageInfo {
    /// Items in the page.
    pub items: usize,
    /// Tombstones among them.
    pub deleted: usize,
    /// Query misses among them.
    pub misses: usize,
    /// Oldest timestamp in the page.
    pub first_timestamp: Option<Timestamp>,
    /// Newest timestamp in the page.
    pub last_timestamp: Option<Timestamp>,
    /// Encoded size of the continue token handed back, if any.
    pub token_bytes: Option<usize>,
}

/// Result of the page command.
#[derive(Debug, Serialize)]
pub struct PageReport {
    /// Records written.
    pub records: usize,
    /// Records deleted.
    pub deleted: usize,
    /// Whether a query sync was paged.
    pub query_sync: bool,
    /// Pages in read order.
    pub pages: Vec<PageInfo>,
    /// Items across all pages.
    pub total_items: usize,
}

/// Runs the page command.
pub fn run(options: &PageOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..options.records {
        store.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())?;
    }
    let deleted = options.deleted.clone();
    let deleted_count = deleted.len();
    for i in deleted {
        store.delete(format!("k{i}").as_bytes())?;
    }

    let reader = SyncDataReader::new(store, CursorConfig::default());
    let spec = DataSizeSpec::new(options.block_size, options.packet_size);
    let query = options.query.as_ref().map(|prefix| {
        let query = SyncQuery::prefix(prefix.as_bytes());
        match &options.value_contains {
            Some(pattern) => query.value_contains(pattern.as_bytes()),
            None => query,
        }
    });

    let mut page = match &query {
        Some(query) => reader.get_sync_data_by_query(
            query.clone(),
            SyncTimeRange::both(0, ALL_TIME),
            spec,
        )?,
        None => reader.get_sync_data(0, ALL_TIME, spec)?,
    };
    tracing::debug!(records = options.records, "paging generated store");

    let mut pages = Vec::new();
    loop {
        let token = page.token.take();
        pages.push(page_info(&page, token.as_ref())?);
        match token {
            Some(token) => page = reader.get_sync_data_next(token, spec)?,
            None => break,
        }
    }

    let report = PageReport {
        records: options.records,
        deleted: deleted_count,
        query_sync: query.is_some(),
        total_items: pages.iter().map(|page| page.items).sum(),
        pages,
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

fn page_info(
    page: &SyncPage,
    token: Option<&ContinueToken>,
) -> Result<PageInfo, Box<dyn std::error::Error>> {
    let token_bytes = match token {
        Some(token) => Some(token.to_parcel()?.len()),
        None => None,
    };
    Ok(PageInfo {
        items: page.items.len(),
        deleted: page.items.iter().filter(|item| item.is_deleted()).count(),
        misses: page
            .items
            .iter()
            .filter(|item| item.flags.contains(DataFlags::REMOTE_DEVICE_DATA_MISS_QUERY))
            .count(),
        first_timestamp: page.items.first().map(|item| item.timestamp),
        last_timestamp: page.items.last().map(|item| item.timestamp),
        token_bytes,
    })
}

fn print_text_output(report: &PageReport) {
    println!("Sync Paging");
    println!("===========");
    println!();
    println!("Records:  {} ({} deleted)", report.records, report.deleted);
    println!(
        "Mode:     {}",
        if report.query_sync { "query" } else { "full" }
    );
    println!();

    println!("Pages");
    println!("-----");
    for (index, page) in report.pages.iter().enumerate() {
        let range = match (page.first_timestamp, page.last_timestamp) {
            (Some(first), Some(last)) => format!("{first}..={last}"),
            _ => "-".to_string(),
        };
        let token = page
            .token_bytes
            .map_or_else(|| "done".to_string(), |len| format!("token {len} B"));
        println!(
            "  #{index:<3} {:>5} items  {:>5} deleted  {:>5} misses  {range}  {token}",
            page.items, page.deleted, page.misses
        );
    }
    println!();
    println!("Total:    {} items in {} pages", report.total_items, report.pages.len());
}
