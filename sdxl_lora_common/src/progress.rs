use indicatif::{ProgressBar, ProgressBarIter, ProgressIterator, ProgressStyle};

/// Progress bar over an exact-size iterator, labelled and colored by `COLOR` (`b`, `g` or `r`).
///
/// ```no_run
/// use sdxl_lora_common::NiceProgressBar;
///
/// for _step in NiceProgressBar::<_, 'g'>(0..30usize, "Denoise loop") {}
/// ```
pub struct NiceProgressBar<T: ExactSizeIterator, const COLOR: char = 'b'>(pub T, pub &'static str);

fn style(label: &str, color: char) -> ProgressStyle {
    let color = match color {
        'g' => "green",
        'r' => "red",
        _ => "blue",
    };
    ProgressStyle::with_template(&format!(
        "{label}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})"
    ))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-")
}

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let bar = ProgressBar::new(self.0.len() as u64);
        bar.set_style(style(self.1, COLOR));
        self.0.progress_with(bar)
    }
}

impl<T: ExactSizeIterator, const COLOR: char> NiceProgressBar<T, COLOR> {
    /// Iterate with the bar drawn only when `silent` is unset.
    pub fn silent(self, silent: bool) -> ProgressBarIter<T> {
        if silent {
            self.0.progress_with(ProgressBar::hidden())
        } else {
            self.into_iter()
        }
    }
}

/// Attach a plain progress bar to an iterator unless `silent` is set.
pub trait IterWithProgress<'a, T>: Iterator<Item = T> + 'a {
    fn with_progress(self, silent: bool) -> Box<dyn Iterator<Item = T> + 'a>
    where
        Self: Sized + ExactSizeIterator,
    {
        if silent {
            Box::new(self)
        } else {
            let bar = ProgressBar::new(self.len() as u64);
            bar.set_style(style("Loading tensors", 'b'));
            Box::new(self.progress_with(bar))
        }
    }
}

impl<'a, T: Iterator<Item = E> + 'a, E> IterWithProgress<'a, E> for T {}
