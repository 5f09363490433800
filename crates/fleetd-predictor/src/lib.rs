//! Predicts near-future CPU/memory load from a window of recent samples and
//! decides whether that warrants scaling.
//!
//! Grounded on `ml_predictor.py` from the original implementation. The
//! online trend/volatility/decision rule below is the full source of truth
//! for scaling decisions; the offline training path is optional and never
//! consulted by it.

use serde::Serialize;

const LOAD_THRESHOLD: f64 = 80.0;
const TREND_WINDOW: usize = 20;
const VOLATILITY_WINDOW: usize = 10;
const MIN_SAMPLES_FOR_DECISION: usize = 10;
const DEFAULT_HORIZON: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum PredictorError {
    #[error("need at least {required} historical points to train, got {got}")]
    InsufficientData { required: usize, got: usize },
    #[error("need at least {required} extracted feature windows to train, got {got}")]
    InsufficientFeatures { required: usize, got: usize },
}

/// Result of `predict_load`: trend/volatility/forecast plus the scale decision.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub predicted_cpu: f64,
    pub predicted_memory: f64,
    pub cpu_trend: f64,
    pub memory_trend: f64,
    pub cpu_volatility: f64,
    pub memory_volatility: f64,
    pub should_scale: bool,
    pub reasons: Vec<String>,
    pub confidence: f64,
}

/// One detected anomaly (§4.3 "Anomalies").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    CpuSpike {
        value: f64,
        expected: f64,
        severity: &'static str,
    },
    MemorySpike {
        value: f64,
        expected: f64,
        severity: &'static str,
    },
    CpuDrop {
        drop: f64,
        severity: &'static str,
    },
}

/// A historical `{cpu_percent, memory_percent}` observation for offline
/// training/evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TrainingPoint {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub samples_used: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub mae: f64,
    pub rmse: f64,
    pub accuracy: f64,
}

/// Ordinary-least-squares slope over `x = 0..n-1`. Zero if `n < 2`.
pub fn trend(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n_f;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, &y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (y - y_mean);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Population standard deviation over the whole slice.
pub fn population_stddev(values: &[f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    variance.sqrt()
}

fn tail(values: &[f64], window: usize) -> &[f64] {
    if values.len() > window {
        &values[values.len() - window..]
    } else {
        values
    }
}

/// Step function of sample count: `<10 -> 0.3, <20 -> 0.5, <50 -> 0.7, else 0.9`.
pub fn confidence(cpu_values: &[f64], memory_values: &[f64]) -> f64 {
    let data_points = cpu_values.len().min(memory_values.len());
    if data_points < 10 {
        0.3
    } else if data_points < 20 {
        0.5
    } else if data_points < 50 {
        0.7
    } else {
        0.9
    }
}

/// Trend/volatility/forecast and the scale decision for a pair of windows.
/// Callers must supply at least [`MIN_SAMPLES_FOR_DECISION`] points; this
/// function does not enforce that minimum itself, matching the original,
/// which is a pure function of whatever window it's handed.
pub fn predict_load(cpu_values: &[f64], memory_values: &[f64], horizon: usize) -> PredictionResult {
    let cpu_trend = trend(tail(cpu_values, TREND_WINDOW));
    let memory_trend = trend(tail(memory_values, TREND_WINDOW));

    let current_cpu = cpu_values.last().copied().unwrap_or(0.0);
    let current_memory = memory_values.last().copied().unwrap_or(0.0);

    let predicted_cpu = (current_cpu + cpu_trend * horizon as f64).min(100.0).max(0.0);
    let predicted_memory = (current_memory + memory_trend * horizon as f64).min(100.0).max(0.0);

    let cpu_volatility = if cpu_values.len() >= VOLATILITY_WINDOW {
        population_stddev(tail(cpu_values, VOLATILITY_WINDOW))
    } else {
        0.0
    };
    let memory_volatility = if memory_values.len() >= VOLATILITY_WINDOW {
        population_stddev(tail(memory_values, VOLATILITY_WINDOW))
    } else {
        0.0
    };

    let mut should_scale = false;
    let mut reasons = Vec::new();

    if predicted_cpu > LOAD_THRESHOLD {
        should_scale = true;
        reasons.push(format!("predicted CPU exceeds {LOAD_THRESHOLD}%"));
    }
    if predicted_memory > LOAD_THRESHOLD {
        should_scale = true;
        reasons.push(format!("predicted memory exceeds {LOAD_THRESHOLD}%"));
    }
    if cpu_trend > 5.0 && current_cpu > 60.0 {
        should_scale = true;
        reasons.push("CPU trend strongly increasing".to_string());
    }
    if memory_trend > 5.0 && current_memory > 60.0 {
        should_scale = true;
        reasons.push("memory trend strongly increasing".to_string());
    }
    if cpu_volatility > 20.0 {
        should_scale = true;
        reasons.push("high CPU volatility detected".to_string());
    }

    PredictionResult {
        predicted_cpu,
        predicted_memory,
        cpu_trend,
        memory_trend,
        cpu_volatility,
        memory_volatility,
        should_scale,
        reasons,
        confidence: confidence(cpu_values, memory_values),
    }
}

/// `|current - mean| > 3*sigma` over the whole slice, plus a medium-severity
/// `cpu_drop` when the last two points fall by more than 40 CPU points.
/// Returns an empty vec if fewer than 10 CPU samples are given.
pub fn detect_anomaly(cpu_values: &[f64], memory_values: &[f64]) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    if cpu_values.len() < MIN_SAMPLES_FOR_DECISION {
        return anomalies;
    }

    let cpu_mean = cpu_values.iter().sum::<f64>() / cpu_values.len() as f64;
    let cpu_std = population_stddev(cpu_values);
    let memory_mean = memory_values.iter().sum::<f64>() / memory_values.len().max(1) as f64;
    let memory_std = population_stddev(memory_values);

    let current_cpu = *cpu_values.last().unwrap();
    let current_memory = memory_values.last().copied().unwrap_or(0.0);

    if (current_cpu - cpu_mean).abs() > 3.0 * cpu_std {
        anomalies.push(Anomaly::CpuSpike {
            value: current_cpu,
            expected: cpu_mean,
            severity: "high",
        });
    }
    if (current_memory - memory_mean).abs() > 3.0 * memory_std {
        anomalies.push(Anomaly::MemorySpike {
            value: current_memory,
            expected: memory_mean,
            severity: "high",
        });
    }
    if cpu_values.len() >= 2 {
        let drop = cpu_values[cpu_values.len() - 2] - current_cpu;
        if drop > 40.0 {
            anomalies.push(Anomaly::CpuDrop {
                drop,
                severity: "medium",
            });
        }
    }

    anomalies
}

/// Count usable 10-point feature windows with a target 5 steps ahead.
/// Stops short of fitting a model: the online rule in [`predict_load`] is
/// the only thing that ever drives a scaling decision.
pub fn train(historical: &[TrainingPoint]) -> Result<TrainingSummary, PredictorError> {
    const MIN_HISTORY: usize = 50;
    const MIN_FEATURES: usize = 20;

    if historical.len() < MIN_HISTORY {
        return Err(PredictorError::InsufficientData {
            required: MIN_HISTORY,
            got: historical.len(),
        });
    }

    let mut samples_used = 0;
    for i in 10..historical.len() - 5 {
        let window = &historical[i - 10..i];
        if window.len() >= 5 {
            samples_used += 1;
        }
    }

    if samples_used < MIN_FEATURES {
        return Err(PredictorError::InsufficientFeatures {
            required: MIN_FEATURES,
            got: samples_used,
        });
    }

    Ok(TrainingSummary { samples_used })
}

/// Run `predict_load` over sliding 10-point windows against a 5-ahead
/// target and report mean absolute / root-mean-square error for CPU%.
pub fn evaluate(test_data: &[TrainingPoint]) -> Option<EvaluationResult> {
    if test_data.len() < 20 {
        return None;
    }

    let mut errors = Vec::new();
    for i in 10..test_data.len() - 5 {
        let cpu_window: Vec<f64> = test_data[i - 10..i].iter().map(|p| p.cpu_percent).collect();
        let memory_window: Vec<f64> = test_data[i - 10..i].iter().map(|p| p.memory_percent).collect();
        let result = predict_load(&cpu_window, &memory_window, DEFAULT_HORIZON);
        errors.push(result.predicted_cpu - test_data[i + 5].cpu_percent);
    }

    if errors.is_empty() {
        return None;
    }

    let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / errors.len() as f64;
    let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt();
    Some(EvaluationResult {
        mae,
        rmse,
        accuracy: (100.0 - mae).max(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_is_zero_for_fewer_than_two_points() {
        assert_eq!(trend(&[]), 0.0);
        assert_eq!(trend(&[42.0]), 0.0);
    }

    #[test]
    fn trend_detects_rising_line() {
        let values = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        assert!((trend(&values) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn population_stddev_of_constant_series_is_zero() {
        assert_eq!(population_stddev(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn predict_load_clamps_forecast_to_100() {
        let cpu = vec![90.0; 12];
        let mut rising = cpu.clone();
        for (i, v) in rising.iter_mut().enumerate() {
            *v += i as f64 * 5.0;
        }
        let result = predict_load(&rising, &cpu, 5);
        assert!(result.predicted_cpu <= 100.0);
    }

    #[test]
    fn predict_load_flags_high_predicted_cpu() {
        let cpu = vec![85.0; 12];
        let mem = vec![20.0; 12];
        let result = predict_load(&cpu, &mem, 5);
        assert!(result.should_scale);
        assert!(result
            .reasons
            .iter()
            .any(|r| r.contains("predicted CPU")));
    }

    #[test]
    fn predict_load_does_not_scale_on_flat_low_load() {
        let cpu = vec![10.0; 15];
        let mem = vec![10.0; 15];
        let result = predict_load(&cpu, &mem, 5);
        assert!(!result.should_scale);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn confidence_step_function() {
        let nine: Vec<f64> = vec![1.0; 9];
        let nineteen: Vec<f64> = vec![1.0; 19];
        let fortynine: Vec<f64> = vec![1.0; 49];
        let fifty: Vec<f64> = vec![1.0; 50];
        assert_eq!(confidence(&nine, &nine), 0.3);
        assert_eq!(confidence(&nineteen, &nineteen), 0.5);
        assert_eq!(confidence(&fortynine, &fortynine), 0.7);
        assert_eq!(confidence(&fifty, &fifty), 0.9);
    }

    #[test]
    fn detect_anomaly_requires_ten_samples() {
        let cpu = vec![10.0; 5];
        let mem = vec![10.0; 5];
        assert!(detect_anomaly(&cpu, &mem).is_empty());
    }

    #[test]
    fn detect_anomaly_flags_cpu_spike() {
        let mut cpu = vec![10.0; 11];
        *cpu.last_mut().unwrap() = 95.0;
        let mem = vec![10.0; 11];
        let anomalies = detect_anomaly(&cpu, &mem);
        assert!(anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::CpuSpike { .. })));
    }

    #[test]
    fn detect_anomaly_flags_cpu_drop() {
        let mut cpu = vec![10.0; 11];
        let last = cpu.len() - 1;
        cpu[last - 1] = 90.0;
        cpu[last] = 10.0;
        let mem = vec![10.0; 11];
        let anomalies = detect_anomaly(&cpu, &mem);
        assert!(anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::CpuDrop { .. })));
    }

    #[test]
    fn train_requires_minimum_history() {
        let history = vec![
            TrainingPoint {
                cpu_percent: 10.0,
                memory_percent: 10.0
            };
            10
        ];
        assert!(matches!(
            train(&history),
            Err(PredictorError::InsufficientData { .. })
        ));
    }

    #[test]
    fn train_succeeds_with_enough_history() {
        let history = vec![
            TrainingPoint {
                cpu_percent: 10.0,
                memory_percent: 10.0
            };
            80
        ];
        let summary = train(&history).unwrap();
        assert!(summary.samples_used >= 20);
    }

    #[test]
    fn evaluate_returns_none_for_short_series() {
        let data = vec![
            TrainingPoint {
                cpu_percent: 10.0,
                memory_percent: 10.0
            };
            10
        ];
        assert!(evaluate(&data).is_none());
    }

    #[test]
    fn evaluate_computes_error_metrics() {
        let data = vec![
            TrainingPoint {
                cpu_percent: 50.0,
                memory_percent: 50.0
            };
            40
        ];
        let result = evaluate(&data).unwrap();
        assert!(result.mae >= 0.0);
        assert!(result.rmse >= 0.0);
        assert!(result.accuracy <= 100.0);
    }
}
