/// Round a channel count to the nearest multiple of `divisor`.
///
/// The result is at least `min_value` (`divisor` when `None`). With
/// `round_down_protect`, the result is bumped by `divisor` when rounding
/// would remove more than 10% of `value`.
///
/// * `value` - Unrounded channel count, e.g. `in_channels * expand_ratio`.
/// * `divisor` - Channel counts are made divisible by this number.
/// * `min_value` - Lower bound of the result.
/// * `round_down_protect` - Do not round down by more than 10%.
pub fn make_divisible(
    value: f64,
    divisor: usize,
    min_value: Option<usize>,
    round_down_protect: bool,
) -> usize {
    let divisor = divisor.max(1);
    let min_value = min_value.unwrap_or(divisor);
    let rounded = (value + divisor as f64 / 2.) as usize / divisor * divisor;
    let mut new_value = min_value.max(rounded);
    if round_down_protect && (new_value as f64) < 0.9 * value {
        new_value += divisor;
    }
    new_value
}
