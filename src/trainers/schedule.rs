//! Iteration-dependent weights and learning rates.

/// Diversity-sensitive loss weight, decayed linearly to 0 over `ds_iter`
pub fn diversity_weight(initial: f64, iter: usize, ds_iter: usize) -> f64 {
    if ds_iter == 0 {
        return 0.0;
    }
    initial * (1.0 - iter as f64 / ds_iter as f64).max(0.0)
}

/// Step decay: the rate halves every `decay_every` iterations
pub fn decayed_lr(base: f64, iter: usize, decay_every: usize) -> f64 {
    if decay_every == 0 {
        return base;
    }
    base * 0.5f64.powi((iter / decay_every) as i32)
}

/// True on the iterations where a periodic task with period `every` fires
pub fn is_due(iter: usize, every: usize) -> bool {
    every > 0 && iter % every == 0
}
