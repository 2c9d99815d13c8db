use core_affinity::{get_core_ids, set_for_current, CoreId};

/// Pin the current thread to `core_id`. Returns the id on success.
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    if let Some(core_ids) = get_core_ids() {
        if core_ids.len() > core_id && set_for_current(CoreId { id: core_id }) {
            return Ok(core_id);
        }
    }
    Err(anyhow::anyhow!("failed to pin core {core_id}"))
}
