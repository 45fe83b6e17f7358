use benchmarks::types::Result as TaskResult;
use comfy_table::{
    Cell, CellAlignment, Color, ContentArrangement, Table,
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

pub fn results_table(results: &[TaskResult]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Shape",
            "Backend",
            "Latency, ms",
            "TFLOPS",
            "GB/s",
            "Max abs diff",
        ]);

    for result in results {
        let latency = format!(
            "{:.3} ± {:.3}",
            result.latency.mean, result.latency.std_dev
        );
        let accuracy = match result.accuracy {
            Some(accuracy) => Cell::new(format!("{:.2e}", accuracy.max_abs_diff))
                .fg(if accuracy.passed {
                    Color::Green
                } else {
                    Color::Red
                }),
            None => Cell::new("baseline"),
        };
        let rate = |value: Option<f64>| match value {
            Some(value) => Cell::new(format!("{value:.3}")),
            None => Cell::new("-"),
        };
        table.add_row(vec![
            Cell::new(&result.shape_name),
            Cell::new(&result.backend),
            Cell::new(latency),
            rate(result.tflops),
            rate(result.gbps),
            accuracy,
        ]);
    }

    for index in 2..=5 {
        if let Some(column) = table.column_mut(index) {
            column.set_cell_alignment(CellAlignment::Right);
        }
    }
    table
}
