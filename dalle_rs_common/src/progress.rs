use indicatif::{ProgressBar, ProgressBarIter, ProgressIterator, ProgressStyle};

/// Wrap an iterator in a progress bar. `COLOR` is one of `b`, `g`, `r`.
///
/// ```rust
/// use dalle_rs_common::NiceProgressBar;
///
/// let total: usize = NiceProgressBar::<_, 'g'>::new(0..4usize, "Counting", true)
///     .into_iter()
///     .sum();
/// assert_eq!(total, 6);
/// ```
pub struct NiceProgressBar<T: ExactSizeIterator, const COLOR: char = 'b'> {
    iter: T,
    label: &'static str,
    silent: bool,
}

impl<T: ExactSizeIterator, const COLOR: char> NiceProgressBar<T, COLOR> {
    pub fn new(iter: T, label: &'static str, silent: bool) -> Self {
        Self {
            iter,
            label,
            silent,
        }
    }
}

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        if self.silent {
            return self.iter.progress_with(ProgressBar::hidden());
        }
        let color = match COLOR {
            'g' => "green",
            'r' => "red",
            _ => "blue",
        };
        let bar = ProgressBar::new(self.iter.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar().template(&format!(
            "{}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})",
            self.label
        )) {
            bar.set_style(style.progress_chars("#>-"));
        }
        self.iter.progress_with(bar)
    }
}
