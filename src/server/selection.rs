use rand::{seq::index, Rng};

/// Uniformly samples `floor(roster * fraction)` distinct roster positions.
///
/// The result only depends on `rng`, seed it for reproducible rounds.
///
/// # Arguments
/// * `roster` - The size of the roster to sample from.
/// * `fraction` - The share of the roster to select, clamped to `[0, 1]`.
/// * `rng` - The random source.
///
/// # Returns
/// The selected positions in ascending order.
pub fn select_clients<R: Rng + ?Sized>(roster: usize, fraction: f32, rng: &mut R) -> Vec<usize> {
    let amount = ((roster as f32 * fraction.clamp(0., 1.)).floor() as usize).min(roster);

    let mut selected = index::sample(rng, roster, amount).into_vec();
    selected.sort_unstable();
    selected
}
