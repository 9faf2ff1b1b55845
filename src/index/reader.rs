use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::error::Result;

use super::aggregate::Aggregate;

/// Aggregates a set of droppings, scanning in parallel when the pool and
/// the workload allow it.
///
/// Workers claim droppings from a shared counter and build one partial
/// aggregate per dropping; the merger then folds partials left-to-right in
/// dropping order with the usual overlap-resolution rules. The fold order is
/// fixed, so the result — chunk id assignment included — matches a serial
/// scan byte for byte.
pub fn aggregate_droppings(
    droppings: &[String],
    backend: &Arc<dyn Backend>,
    threads: usize,
) -> Result<Aggregate> {
    if droppings.len() <= 1 || threads <= 1 {
        let mut agg = Aggregate::new();
        for bpath in droppings {
            agg.absorb_dropping(bpath, backend)?;
        }
        return Ok(agg);
    }

    let next = AtomicUsize::new(0);
    let partials: Vec<Mutex<Option<Result<Aggregate>>>> =
        droppings.iter().map(|_| Mutex::new(None)).collect();
    let workers = threads.min(droppings.len());
    tracing::debug!(droppings = droppings.len(), workers, "parallel index scan");

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= droppings.len() {
                    break;
                }
                let mut agg = Aggregate::new();
                let res = agg.absorb_dropping(&droppings[i], backend).map(|()| agg);
                if let Ok(mut slot) = partials[i].lock() {
                    *slot = Some(res);
                }
            });
        }
    });

    let mut out = Aggregate::new();
    for cell in partials {
        let res = cell.into_inner()?.expect("every dropping slot is filled");
        out.merge(res?);
    }
    Ok(out)
}
