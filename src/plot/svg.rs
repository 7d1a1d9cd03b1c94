//! Chart images drawn with `plotters`.
//!
//! The x axis (prime record count) is always log2 scaled. The y axis follows
//! the chart's [`Scale`]; on a log axis, non-positive values cannot be drawn
//! and are left out.

use super::{Chart, ChartPoint, PlotRenderer, Scale};
use anyhow::{anyhow, Result};
use plotters::prelude::*;
use std::path::Path;

/// Output size in pixels (8x6in at 100dpi)
pub const CHART_SIZE: (u32, u32) = (800, 600);

/// Width of the error bar caps in pixels
const ERR_CAP: u32 = 6;

/// Renders charts as SVG images.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvgChartRenderer;

impl PlotRenderer for SvgChartRenderer {
    fn extension(&self) -> &'static str {
        "svg"
    }

    fn render(&self, chart: &Chart, path: &Path) -> Result<()> {
        let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let (x_lo, x_hi) = x_bounds(chart);
        let (y_lo, y_hi) = y_bounds(chart);

        // linear and log axes are distinct coordinate types
        macro_rules! draw {
            ($y_range:expr) => {{
                let mut ctx = ChartBuilder::on(&root)
                    .caption(&chart.title, ("sans-serif", 22))
                    .margin(12)
                    .x_label_area_size(40)
                    .y_label_area_size(80)
                    .build_cartesian_2d((x_lo..x_hi).log_scale().base(2.0), $y_range)
                    .map_err(draw_err)?;

                ctx.configure_mesh()
                    .x_desc(chart.x_label.as_str())
                    .y_desc(chart.y_label.as_str())
                    .draw()
                    .map_err(draw_err)?;

                for (idx, line) in chart.lines.iter().enumerate() {
                    let color = Palette99::pick(idx).to_rgba();
                    let points: Vec<&ChartPoint> = line
                        .points
                        .iter()
                        .filter(|p| drawable(chart.y_scale, p.y))
                        .collect();

                    ctx.draw_series(LineSeries::new(
                        points.iter().map(|p| (p.x, p.y)),
                        color.stroke_width(2),
                    ))
                    .map_err(draw_err)?
                    .label(line.label.as_str())
                    .legend(move |(x, y)| {
                        PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                    });

                    ctx.draw_series(points.iter().map(|p| {
                        ErrorBar::new_vertical(
                            p.x,
                            (p.y - p.y_err).max(y_lo),
                            p.y,
                            (p.y + p.y_err).min(y_hi),
                            color.stroke_width(1),
                            ERR_CAP,
                        )
                    }))
                    .map_err(draw_err)?;
                }

                if !chart.lines.is_empty() {
                    ctx.configure_series_labels()
                        .background_style(WHITE.mix(0.8))
                        .border_style(&BLACK)
                        .position(SeriesLabelPosition::UpperLeft)
                        .draw()
                        .map_err(draw_err)?;
                }
            }};
        }

        match chart.y_scale {
            Scale::Linear => draw!(y_lo..y_hi),
            Scale::Log => draw!((y_lo..y_hi).log_scale()),
        }

        root.present().map_err(draw_err)?;
        Ok(())
    }
}

fn draw_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("failed to draw chart: {}", e)
}

fn drawable(scale: Scale, y: f64) -> bool {
    y.is_finite() && (scale == Scale::Linear || y > 0.0)
}

/// Range of the x axis; prime counts start at 1, so the log axis is safe.
fn x_bounds(chart: &Chart) -> (f64, f64) {
    let xs = chart
        .lines
        .iter()
        .flat_map(|l| l.points.iter().map(|p| p.x))
        .filter(|x| *x > 0.0);
    match min_max(xs) {
        Some((lo, hi)) if hi > lo => (lo, hi),
        Some((lo, _)) => (lo / 2.0, lo * 2.0),
        None => (1.0, 2.0),
    }
}

/// Range of the y axis, including the error bars.
fn y_bounds(chart: &Chart) -> (f64, f64) {
    let points = chart
        .lines
        .iter()
        .flat_map(|l| l.points.iter())
        .filter(|p| drawable(chart.y_scale, p.y));

    match chart.y_scale {
        Scale::Linear => {
            let ys = points.flat_map(|p| [p.y - p.y_err, p.y + p.y_err]);
            match min_max(ys) {
                Some((lo, hi)) => {
                    let lo = lo.min(0.0);
                    let hi = if hi > lo { hi * 1.05 } else { lo + 1.0 };
                    (lo, hi)
                }
                None => (0.0, 1.0),
            }
        }
        Scale::Log => match min_max(points.map(|p| p.y)) {
            Some((lo, hi)) => (lo / 2.0, hi * 2.0),
            None => (1.0, 10.0),
        },
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::ChartLine;

    fn point(x: f64, y: f64, y_err: f64) -> ChartPoint {
        ChartPoint {
            x,
            y,
            y_err,
            samples: 1,
        }
    }

    fn chart(scale: Scale, lines: Vec<ChartLine>) -> Chart {
        Chart {
            title: "get-all".into(),
            x_label: "prime-count".into(),
            y_label: "ns/op".into(),
            y_scale: scale,
            lines,
        }
    }

    #[test]
    fn test_bounds() {
        let c = chart(
            Scale::Linear,
            vec![ChartLine {
                label: "flatfs".into(),
                points: vec![point(1.0, 10.0, 2.0), point(1024.0, 40.0, 0.0)],
            }],
        );
        assert_eq!(x_bounds(&c), (1.0, 1024.0));
        let (lo, hi) = y_bounds(&c);
        assert_eq!(lo, 0.0);
        assert!((hi - 42.0).abs() < 1e-9);

        // zero cannot be placed on a log axis
        let c = chart(
            Scale::Log,
            vec![ChartLine {
                label: "flatfs".into(),
                points: vec![point(4.0, 0.0, 0.0), point(4.0, 8.0, 1.0)],
            }],
        );
        assert_eq!(x_bounds(&c), (2.0, 8.0));
        assert_eq!(y_bounds(&c), (4.0, 16.0));

        let empty = chart(Scale::Log, Vec::new());
        assert_eq!(x_bounds(&empty), (1.0, 2.0));
        assert_eq!(y_bounds(&empty), (1.0, 10.0));
    }

    #[test]
    fn test_renders_svg_with_legend() {
        let dir = tempfile::tempdir().unwrap();
        for scale in [Scale::Linear, Scale::Log] {
            let c = chart(
                scale,
                vec![
                    ChartLine {
                        label: "flatfs".into(),
                        points: vec![point(1.0, 120.0, 5.0), point(256.0, 300.0, 20.0)],
                    },
                    ChartLine {
                        label: "memory-map".into(),
                        points: vec![point(1.0, 30.0, 0.0)],
                    },
                ],
            );
            let path = dir.path().join(format!("{}.svg", c.file_stem()));
            SvgChartRenderer.render(&c, &path).unwrap();

            let svg = std::fs::read_to_string(&path).unwrap();
            assert!(svg.starts_with("<svg"));
            assert!(svg.contains("flatfs"));
            assert!(svg.contains("memory-map"));
        }
    }
}
