//! Report rendering.

use cli_table::{format::Justify, Cell, Style, Table};

use crate::aggregate::NamespaceAggregate;
use crate::event::{cap_names, mask_to_caps, Sample};
use crate::proc;

const NO_CAPS: &str = "No capabilities needed";

fn caps_column(mask: u64) -> String {
    if mask == 0 {
        return NO_CAPS.to_string();
    }
    cap_names(mask_to_caps(mask)).join(", ")
}

/// Render the per-pid table to stdout.
pub fn print_pid_table(samples: &[Sample]) -> std::io::Result<()> {
    let rows: Vec<_> = samples
        .iter()
        .map(|sample| {
            vec![
                sample.pid.cell().justify(Justify::Right),
                sample.ppid.cell().justify(Justify::Right),
                proc::process_name(sample.pid).cell(),
                caps_column(sample.mask).cell(),
            ]
        })
        .collect();

    let table = rows.table().title(vec![
        "PID".cell().bold(true),
        "PPID".cell().bold(true),
        "NAME".cell().bold(true),
        "CAPABILITIES".cell().bold(true),
    ]);
    cli_table::print_stdout(table)
}

/// Render the per-namespace table to stdout.
pub fn print_namespace_table(aggregates: &[NamespaceAggregate]) -> std::io::Result<()> {
    let rows: Vec<_> = aggregates
        .iter()
        .map(|aggregate| {
            vec![
                aggregate.ns.cell().justify(Justify::Right),
                caps_column(aggregate.mask).cell(),
            ]
        })
        .collect();

    let table = rows.table().title(vec![
        "NAMESPACE".cell().bold(true),
        "CAPABILITIES".cell().bold(true),
    ]);
    cli_table::print_stdout(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capctl::caps::Cap;
    use pretty_assertions::assert_eq;

    #[test]
    fn zero_mask_reads_as_no_caps() {
        assert_eq!(caps_column(0), NO_CAPS);
    }

    #[test]
    fn caps_are_listed_sorted() {
        let mask = (1 << Cap::NET_RAW as u8) | (1 << Cap::NET_ADMIN as u8);
        assert_eq!(caps_column(mask), "cap_net_admin, cap_net_raw");
    }
}
