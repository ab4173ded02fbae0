use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::core::Payload;
use crate::graph::{Graph, StepId};

#[derive(Debug, Clone, Copy)]
pub struct StepExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Execution metrics of a pipeline.
///
/// Holds the timing of the latest successful execution of every step, see
/// [`crate::Pipeline::diagnostics`].
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub execution_times: HashMap<StepId, StepExecution>,
}

impl Diagnostics {
    pub(crate) fn record(&mut self, timings: impl IntoIterator<Item = (StepId, StepExecution)>) {
        self.execution_times.extend(timings);
    }

    pub(crate) fn forget(&mut self, graph: &Graph<impl Payload>) {
        self.execution_times.retain(|&step, _| graph.contains_step(step));
    }

    /// Sum of the recorded step durations.
    pub fn total(&self) -> Duration {
        self.execution_times.values().map(|e| e.duration).sum()
    }

    /// Renders the steps of the graph as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Not run yet
    pub fn render_mermaid<P: Payload>(&self, graph: &Graph<P>) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // all steps took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let mut data_ids: Vec<_> = graph.data_ids().collect();
        data_ids.sort();

        for data in data_ids {
            let Ok(node) = graph.data(data) else { continue };
            let _ = writeln!(f, "    {data}[(\"{}\")]", node.name().replace('"', "\\\""));

            let mut previous = data.to_string();
            for &step in node.steps() {
                let Ok(step_node) = graph.step(step) else { continue };
                let name = step_node.name().replace('"', "\\\"");

                let (label, color) = match times.get(&step) {
                    Some(exec) => {
                        let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                        (format!("{:.2?}", exec.duration), heat(t))
                    }
                    None => ("Pending".to_string(), "#ADD8E6".to_string()),
                };

                let _ = writeln!(f, "    {step}[\"{name}\\n{label}\"]");
                let _ = writeln!(f, "    style {step} fill:{color}");
                let _ = writeln!(f, "    {previous} --> {step}");
                previous = step.to_string();

                if let Some(child) = graph.child(step) {
                    let _ = writeln!(f, "    {step} --> {child}");
                }
            }
        }

        f
    }
}

/// Green (0.0) through yellow (0.5) to red (1.0).
fn heat(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}
