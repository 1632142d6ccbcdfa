//! Console summary of a sweep.

use crate::stats::Stats;

const HEADERS: [&str; 9] = [
    "Provider",
    "Scheme",
    "Protocol",
    "Port",
    "Connected",
    "Time to candidate",
    "Time to connected",
    "Max Throughput",
    "TURN Transfer Latency",
];

/// Render one row per result. Unset metrics render as empty cells.
pub fn render(results: &[Stats]) -> String {
    let rows: Vec<[String; 9]> = results.iter().map(row).collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    push_line(&mut out, &HEADERS.map(String::from), &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&rule.join("-+-"));
    out.push('\n');
    for row in &rows {
        push_line(&mut out, row, &widths);
    }
    out
}

fn row(stats: &Stats) -> [String; 9] {
    [
        stats.provider.clone(),
        stats.scheme.clone(),
        stats.protocol.clone(),
        stats.port.clone(),
        if stats.connected { "yes" } else { "no" }.to_string(),
        millis(stats.offerer_time_to_receive_candidate),
        millis(stats.time_to_connected_state),
        speed(stats.throughput_max),
        millis(stats.latency_first_packet),
    ]
}

fn push_line(out: &mut String, cells: &[String; 9], widths: &[usize; 9]) {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    out.push_str(padded.join(" | ").trim_end());
    out.push('\n');
}

fn millis(value: f64) -> String {
    if value > 0.0 {
        format!("{value:.0} ms")
    } else {
        String::new()
    }
}

fn speed(mbps: f64) -> String {
    if mbps <= 0.0 {
        String::new()
    } else if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{mbps:.1} Mbps")
    }
}
