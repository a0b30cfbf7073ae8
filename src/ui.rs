//! Interface de terminal do jobkernel: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`ProcessProgress`] acompanha visualmente
//! a execução de um processo no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use jobkernel::{ProcessOutcome, ProcessReport};

/// Indicador visual de progresso para a execução de um processo.
///
/// Exibe um spinner animado enquanto o processo roda e mensagens
/// coloridas para sucesso (verde) e falha (vermelho).
pub struct ProcessProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para mensagens de sucesso.
    green: Style,
    // Estilo vermelho para mensagens de falha.
    red: Style,
    // Estilo esmaecido para detalhes.
    dim: Style,
}

impl ProcessProgress {
    /// Inicia o spinner com a descrição do processo.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Finaliza o spinner e exibe o resultado do processo.
    pub fn finish(&self, report: &ProcessReport) {
        self.pb.finish_and_clear();
        let took = report.duration().num_milliseconds();
        match &report.outcome {
            ProcessOutcome::Completed => {
                println!(
                    "  {} Process {} completed {}",
                    self.green.apply_to("✓"),
                    report.process_id,
                    self.dim
                        .apply_to(format!("({} threads, {} jobs, {took}ms)", report.threads, report.jobs_executed))
                );
            }
            ProcessOutcome::Fatal(failure) | ProcessOutcome::Unrecoverable(failure) => {
                println!(
                    "  {} Process {} failed: {failure}",
                    self.red.apply_to("✗"),
                    report.process_id
                );
            }
        }
        if let Some(value) = report.result.value() {
            println!("  {} {value}", self.dim.apply_to("result:"));
        }
    }

    /// Imprime o relatório formatado em JSON com estilo colorido.
    pub fn print_report(&self, report: &ProcessReport) {
        let style = if report.is_success() { &self.green } else { &self.red };
        println!();
        println!("{}", style.apply_to("─── Process Report ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
    }
}
