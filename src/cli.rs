//! Interface de linha de comando do jobkernel baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, config)
//! e flags globais (--workers, --team, --verbose).

use clap::{Parser, Subcommand, ValueEnum};
use jobkernel::TeamKind;

/// jobkernel: motor de execução de jobs com teams, recursos e escalonamento.
#[derive(Debug, Parser)]
#[command(name = "jobkernel", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Número de threads do pool (sobrescreve `jobkernel.toml` e `JOBKERNEL_WORKERS`).
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    pub workers: Option<u32>,

    /// Team que executa os jobs nesta sessão.
    #[arg(long, global = true)]
    pub team: Option<TeamArg>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Team aceito pela CLI, mapeado para [`TeamKind`] internamente.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TeamArg {
    /// Executa na própria thread que ativou o job.
    Passive,
    /// Pool fixo de threads.
    Pool,
    /// Uma thread do sistema por job.
    Thread,
    /// Pool de bloqueio do runtime tokio.
    Tokio,
}

impl From<TeamArg> for TeamKind {
    fn from(arg: TeamArg) -> Self {
        match arg {
            TeamArg::Passive => TeamKind::Passive,
            TeamArg::Pool => TeamKind::Pool,
            TeamArg::Thread => TeamKind::ThreadPerJob,
            TeamArg::Tokio => TeamKind::Tokio,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o pipeline de pedidos de demonstração.
    Demo {
        /// Quantidade de pedidos a processar.
        #[arg(long, default_value_t = 8)]
        orders: u64,

        /// Latência simulada do gateway de pagamento, em milissegundos.
        #[arg(long, default_value_t = 25)]
        latency_ms: u64,

        /// Imprime o relatório do processo em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Mostra a configuração efetiva em TOML.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_demo_subcommand() {
        let cli = Cli::parse_from(["jobkernel", "demo", "--orders", "3", "--json"]);
        match cli.command {
            Command::Demo {
                orders,
                latency_ms,
                json,
            } => {
                assert_eq!(orders, 3);
                assert_eq!(latency_ms, 25);
                assert!(json);
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "jobkernel",
            "--workers",
            "6",
            "--team",
            "thread",
            "--verbose",
            "config",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.workers, Some(6));
        assert_eq!(cli.team.map(TeamKind::from), Some(TeamKind::ThreadPerJob));
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn cli_rejects_zero_workers() {
        assert!(Cli::try_parse_from(["jobkernel", "--workers", "0", "config"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
