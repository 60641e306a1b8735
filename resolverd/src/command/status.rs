use crate::{command::describe, database::Database};
use ethbtc::{
    completion::{can_complete_swap, can_refund_swap},
    Clock, SystemClock,
};

pub fn status(db: &Database) -> anyhow::Result<()> {
    let now = SystemClock.now();
    let swaps = db.all_swaps()?;

    if swaps.is_empty() {
        println!("no swaps");
    }

    for swap in swaps {
        let mut line = describe(&swap);
        if can_complete_swap(&swap, now) {
            line.push_str(" [can complete]");
        }
        if can_refund_swap(&swap, now) {
            line.push_str(" [can refund]");
        }
        if let Some(reason) = &swap.manual_reconciliation {
            line.push_str(&format!(" [needs reconciliation: {}]", reason));
        }

        println!("{}", line);
    }

    Ok(())
}
