use crate::Result;
use comfy_table::{ContentArrangement, Table, presets};

/// A borderless table that wraps to the terminal width.
///
/// The header row is left out when `hide_header` is set or stdout is not a
/// terminal, so piped output stays one tunnel per line.
pub fn tunnel_table(header: &[&str], hide_header: bool) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    if !hide_header && console::user_attended() {
        table.set_header(header.to_vec());
    }
    table
}

pub fn print_table(table: Table) -> Result<()> {
    for line in table.to_string().lines() {
        // trailing columns are often empty
        println!("{}", line.trim_end());
    }
    Ok(())
}
