use benchmarks::operator::catalog;
use console::Style;

pub fn handle_list() {
    let title = Style::new().bold();
    let dim = Style::new().dim();
    for summary in catalog() {
        println!(
            "{}",
            title.apply_to(format!("{} ({})", summary.name, summary.mode))
        );
        for backend in &summary.backends {
            let marker = if *backend == summary.baseline {
                " (baseline)"
            } else {
                ""
            };
            println!("  {backend}{marker}");
        }
        println!("  {}", dim.apply_to("built-in shapes:"));
        for shape in &summary.shapes {
            println!("    {}", dim.apply_to(shape));
        }
    }
}
