//! Chart and results output.
//!
//! The chart plots condition value against mean completion time with
//! asymmetric error bars spanning the confidence interval. Conditions that
//! produced no summary are not drawn as points; they are named in a note
//! under the title instead.

use crate::runner::{ConditionOutcome, ExperimentResult};
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const SERIES_COLOR: RGBColor = BLUE;

/// Chart rendering errors
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to draw chart '{}': {message}", .path.display())]
    Draw { path: PathBuf, message: String },
}

/// Labels and size of the chart
#[derive(Debug, Clone, PartialEq)]
pub struct ChartStyle {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub width: u32,
    pub height: u32,
}

impl Default for ChartStyle {
    fn default() -> Self {
        Self {
            title: "Completion Time vs p".to_string(),
            x_label: "p (Number of words per packet)".to_string(),
            y_label: "Average Completion Time (seconds)".to_string(),
            width: 1000,
            height: 600,
        }
    }
}

/// One plotted condition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotPoint {
    pub x: f64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

impl PlotPoint {
    /// Error bar magnitudes below and above the mean
    pub fn errors(&self) -> (f64, f64) {
        (self.mean - self.lower, self.upper - self.mean)
    }
}

/// Points the chart will draw, in condition order
pub fn plot_points(result: &ExperimentResult) -> Vec<PlotPoint> {
    result
        .measured()
        .map(|(x, s)| PlotPoint {
            x: x as f64,
            mean: s.mean,
            lower: s.lower_bound,
            upper: s.upper_bound,
        })
        .collect()
}

/// Legend text for the series, e.g. "mean ± 95% CI"
pub fn legend_label(confidence: f64) -> String {
    let pct = confidence * 100.0;
    if (pct - pct.round()).abs() < 1e-9 {
        format!("mean ± {:.0}% CI", pct)
    } else {
        format!("mean ± {:.1}% CI", pct)
    }
}

/// Note naming the conditions that have no point on the chart
fn missing_note(result: &ExperimentResult) -> Option<String> {
    let missing: Vec<String> = result
        .unmeasured()
        .map(|c| {
            let tag = match c.outcome {
                ConditionOutcome::Skipped { .. } => " (skipped)",
                _ => "",
            };
            format!("{}{}", c.value, tag)
        })
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(format!("no data: {} = {}", result.field, missing.join(", ")))
    }
}

/// Axis range with some headroom; never empty
fn padded(min: f64, max: f64) -> (f64, f64) {
    let span = max - min;
    let pad = if span > 0.0 {
        span * 0.1
    } else {
        (min.abs() * 0.1).max(1e-3)
    };
    (min - pad, max + pad)
}

/// Draw `result` as a PNG at `path`, replacing any existing file
pub fn render(result: &ExperimentResult, style: &ChartStyle, path: &Path) -> Result<(), RenderError> {
    let draw_err = |e: &dyn std::fmt::Display| RenderError::Draw {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let points = plot_points(result);
    let note = missing_note(result);
    if let Some(note) = &note {
        warn!(%note, "Some conditions have no data");
    }

    let (x_range, y_range) = if points.is_empty() {
        ((0.0, 1.0), (0.0, 1.0))
    } else {
        let x_min = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let x_max = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let y_min = points.iter().map(|p| p.lower).fold(f64::INFINITY, f64::min);
        let y_max = points.iter().map(|p| p.upper).fold(f64::NEG_INFINITY, f64::max);
        let x = if x_max > x_min {
            (x_min - 0.5, x_max + 0.5)
        } else {
            (x_min - 1.0, x_max + 1.0)
        };
        (x, padded(y_min, y_max))
    };

    let root = BitMapBackend::new(path, (style.width, style.height)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| draw_err(&e))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(&style.title, ("sans-serif", 24))
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(80)
        .build_cartesian_2d(x_range.0..x_range.1, y_range.0..y_range.1)
        .map_err(|e| draw_err(&e))?;

    chart
        .configure_mesh()
        .x_desc(style.x_label.as_str())
        .y_desc(style.y_label.as_str())
        .draw()
        .map_err(|e| draw_err(&e))?;

    chart
        .draw_series(LineSeries::new(
            points.iter().map(|p| (p.x, p.mean)),
            SERIES_COLOR.stroke_width(2),
        ))
        .map_err(|e| draw_err(&e))?
        .label(legend_label(result.confidence))
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], SERIES_COLOR));

    chart
        .draw_series(points.iter().map(|p| {
            ErrorBar::new_vertical(p.x, p.lower, p.mean, p.upper, SERIES_COLOR.filled(), 10)
        }))
        .map_err(|e| draw_err(&e))?;

    chart
        .draw_series(
            points
                .iter()
                .map(|p| Circle::new((p.x, p.mean), 4, SERIES_COLOR.filled())),
        )
        .map_err(|e| draw_err(&e))?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| draw_err(&e))?;

    if let Some(note) = note {
        root.draw(&Text::new(note, (100, 45), ("sans-serif", 14).into_font()))
            .map_err(|e| draw_err(&e))?;
    }

    root.present().map_err(|e| draw_err(&e))?;
    info!(path = %path.display(), points = points.len(), "Chart written");
    Ok(())
}

/// Write `result` as pretty JSON at `path`
pub fn write_results(result: &ExperimentResult, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(result).map_err(std::io::Error::other)?;
    std::fs::write(path, json + "\n")?;
    info!(path = %path.display(), "Results written");
    Ok(())
}
