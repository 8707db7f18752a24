use crate::report::{CheckResult, CheckStatus, Report};
use std::fmt::Write;

const STYLE: &str = r#"
body { font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; margin: 2em; color: #222; background: #fafafa; }
h1 { margin-bottom: 0.2em; }
.meta { color: #666; margin-bottom: 1em; }
.totals span { margin-right: 1em; }
.actions { margin: 1em 0; }
.actions button { padding: 0.4em 1em; margin-right: 0.5em; cursor: pointer; }
details { background: #fff; border: 1px solid #ddd; border-radius: 4px; margin-bottom: 0.8em; }
summary { padding: 0.6em 1em; font-weight: bold; cursor: pointer; }
table { border-collapse: collapse; width: 100%; table-layout: fixed; }
th, td { border-top: 1px solid #eee; padding: 0.4em 0.6em; text-align: left; vertical-align: top; }
th { background: #f0f0f0; }
td.command, td.output { font-family: monospace; font-size: 0.85em; white-space: pre-wrap; word-break: break-all; }
.badge { display: inline-block; padding: 0.15em 0.6em; border-radius: 3px; color: #fff; font-size: 0.8em; font-weight: bold; }
.badge-pass { background: #2e7d32; }
.badge-fail { background: #c62828; }
.badge-partial { background: #ef6c00; }
"#;

const SCRIPT: &str = r#"
function csvCell(text) {
  return '"' + text.replace(/"/g, '""') + '"';
}
function exportCsv(onlyProblems) {
  var lines = ['"Category","Test","Command","Result","Status","Notes"'];
  var rows = document.querySelectorAll('tr.result-row');
  for (var i = 0; i < rows.length; i++) {
    var row = rows[i];
    var status = row.getAttribute('data-status');
    if (onlyProblems && status === 'PASS') { continue; }
    var cells = row.querySelectorAll('td');
    var fields = [row.getAttribute('data-category')];
    for (var j = 0; j < cells.length; j++) { fields.push(cells[j].innerText); }
    lines.push(fields.map(csvCell).join(','));
  }
  var blob = new Blob([lines.join('\n') + '\n'], { type: 'text/csv;charset=utf-8' });
  var link = document.createElement('a');
  link.href = URL.createObjectURL(blob);
  link.download = document.body.getAttribute('data-stem') + (onlyProblems ? '_failures.csv' : '.csv');
  document.body.appendChild(link);
  link.click();
  document.body.removeChild(link);
}
"#;

pub fn render(report: &Report) -> String {
    let mut out = String::with_capacity(16 * 1024);
    let totals = report.totals();
    let host = escape(report.host());
    let generated = report.generated_at().format("%Y-%m-%d %H:%M:%S %Z").to_string();

    out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = writeln!(out, "<title>System test report: {host}</title>");
    let _ = writeln!(out, "<style>{STYLE}</style>");
    out.push_str("</head>\n");
    let _ = writeln!(out, "<body data-stem=\"{}\">", escape(&report.file_stem()));
    let _ = writeln!(out, "<h1>System test report: {host}</h1>");
    let _ = writeln!(out, "<div class=\"meta\">Generated {}</div>", escape(&generated));
    let _ = writeln!(
        out,
        "<div class=\"totals\"><span>{} {}</span><span>{} {}</span><span>{} {}</span></div>",
        badge(CheckStatus::Pass),
        totals.pass,
        badge(CheckStatus::Fail),
        totals.fail,
        badge(CheckStatus::Partial),
        totals.partial,
    );
    out.push_str(
        "<div class=\"actions\">\
<button type=\"button\" onclick=\"exportCsv(false)\">Export all results (CSV)</button>\
<button type=\"button\" onclick=\"exportCsv(true)\">Export failures (CSV)</button>\
</div>\n",
    );

    for (category, rows) in report.sections() {
        let open = if rows.iter().any(|r| r.status() != CheckStatus::Pass) {
            " open"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "<details id=\"{}\"{open}>\n<summary>{} ({})</summary>",
            category.slug(),
            escape(category.title()),
            rows.len()
        );
        out.push_str(
            "<table>\n<thead><tr><th style=\"width:15%\">Test</th><th style=\"width:20%\">Command</th>\
<th>Result</th><th style=\"width:8%\">Status</th><th style=\"width:15%\">Notes</th></tr></thead>\n<tbody>\n",
        );
        for row in rows {
            render_row(&mut out, category.title(), row);
        }
        out.push_str("</tbody>\n</table>\n</details>\n");
    }

    let _ = writeln!(out, "<script>{SCRIPT}</script>");
    out.push_str("</body>\n</html>\n");
    out
}

fn render_row(out: &mut String, category_title: &str, row: &CheckResult) {
    let _ = writeln!(
        out,
        "<tr class=\"result-row\" data-category=\"{}\" data-status=\"{}\"><td>{}</td><td class=\"command\">{}</td><td class=\"output\">{}</td><td>{}</td><td>{}</td></tr>",
        escape(category_title),
        row.status().label(),
        escape(row.name()),
        escape(row.command()),
        escape(row.result()),
        badge(row.status()),
        escape(row.notes()),
    );
}

fn badge(status: CheckStatus) -> String {
    let class = match status {
        CheckStatus::Pass => "badge-pass",
        CheckStatus::Fail => "badge-fail",
        CheckStatus::Partial => "badge-partial",
    };
    format!("<span class=\"badge {class}\">{}</span>", status.label())
}

pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
