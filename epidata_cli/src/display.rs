use comfy_table::{presets::NOTHING, *};

use epidata::download::DownloadReport;
use epidata::geocode::Resolved;
use epidata::store::MergeOutcome;
use epidata::update::UpdateReport;

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .into_iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        )
        .set_style(comfy_table::TableComponent::BottomBorder, '─')
        .set_style(comfy_table::TableComponent::MiddleHeaderIntersections, '─')
        .set_style(comfy_table::TableComponent::HeaderLines, '─')
        .set_style(comfy_table::TableComponent::BottomBorderIntersections, '─')
        .set_style(comfy_table::TableComponent::TopBorder, '─')
        .set_style(comfy_table::TableComponent::TopBorderIntersections, '─');
    table
}

pub fn display_geocodes(country: &str, rows: &[(String, Option<Resolved>)]) {
    let mut table = new_table(vec!["Name", "Country", "ISO 3166-2", "Canonical name"]);
    for (name, resolved) in rows {
        let (code, canonical) = resolved
            .as_ref()
            .map_or(("-", "(unresolved)"), |r| (r.code.as_str(), r.name.as_str()));
        table.add_row(vec![name.as_str(), country, code, canonical]);
    }
    println!("\n{}", table);
}

pub fn display_report(report: &UpdateReport) {
    let mut table = new_table(vec!["Source", "Status"]);
    for name in &report.succeeded {
        table.add_row(vec![name.as_str(), "ok"]);
    }
    for (name, err) in &report.failed {
        table.add_row(vec![name.clone(), format!("failed: {err}")]);
    }
    println!("\n{}", table);
}

pub fn display_outcome(store: &str, outcome: &MergeOutcome) {
    match outcome {
        MergeOutcome::Skipped => println!("{store}: no new rows, left untouched"),
        MergeOutcome::Written { rows } => println!("{store}: {rows} rows"),
    }
}

pub fn display_downloads(report: &DownloadReport) {
    let mut table = new_table(vec!["Downloaded", "Failed", "Skipped"]);
    table.add_row(vec![
        report.downloaded.to_string(),
        report.failed.to_string(),
        report.skipped.to_string(),
    ]);
    println!("\n{}", table);
}
