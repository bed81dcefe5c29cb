use std::{fs, path::Path};

const RESULTS_PATH: &str = "crates/attention/benchmarks/RESULTS.md";

pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut lines = vec![
        format!("| {} |", headers.join(" | ")),
        format!("|{}", " --- |".repeat(headers.len())),
    ];
    lines.extend(rows.iter().map(|row| format!("| {} |", row.join(" | "))));
    lines.join("\n") + "\n"
}

/// Replaces (or appends) the `<!-- NAME_START -->` .. `<!-- NAME_END -->`
/// block of the results file.
pub fn record_section(name: &str, content: &str) -> std::io::Result<()> {
    let name = name.to_uppercase();
    let start = format!("<!-- {name}_START -->");
    let end = format!("<!-- {name}_END -->");
    let path = Path::new(RESULTS_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = fs::read_to_string(path)
        .unwrap_or_else(|_| "# ALiBi attention benchmarks\n\n".to_string());
    let block = format!("{start}\n{content}\n{end}\n");
    match (body.find(&start), body.find(&end)) {
        (Some(from), Some(to)) => {
            let stop = (to + end.len() + 1).min(body.len());
            body.replace_range(from..stop, &block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }
    fs::write(path, body)
}
