use dcaforecast::services::economics::{EconomicsReport, NpvSummary};

pub fn format_economics_report(report: &EconomicsReport) -> String {
    let irr = match report.irr_p50() {
        Some(value) => format!("{:.2}%", value * 100.0),
        None => "n/a".to_string(),
    };

    let mut lines = Vec::new();
    lines.push("Cashflow Report".to_string());
    lines.push(format!("Model: {} ({})", report.model, report.kind));
    lines.push(format!("Iterations: {}", report.iterations));
    lines.push(format!(
        "Rates quoted per {} period, cash flows per {} period",
        report.freq_rate, report.freq_cashflow
    ));
    lines.push(String::new());
    lines.push("NPV:".to_string());
    lines.push("Rate | P10 | P50 | P90 | Mean".to_string());
    lines.push("-----|-----|-----|-----|-----".to_string());
    for summary in &report.npv {
        lines.push(format_npv_row(summary));
    }
    lines.push(String::new());
    lines.push(format!("IRR (P50): {irr}"));
    let missing = report.iterations_without_irr();
    if missing > 0 {
        lines.push(format!("Iterations without IRR: {missing}"));
    }
    if !report.failures.is_empty() {
        lines.push(format!("Failed: {}", report.failures.join(", ")));
    }

    lines.join("\n")
}

fn format_npv_row(summary: &NpvSummary) -> String {
    format!(
        "{rate:.2}% | {p10:.2} | {p50:.2} | {p90:.2} | {mean:.2}",
        rate = summary.rate * 100.0,
        p10 = summary.p10,
        p50 = summary.p50,
        p90 = summary.p90,
        mean = summary.mean
    )
}
