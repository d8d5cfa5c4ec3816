//! Interface de linha de comando do massblock baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status, serve, demo)
//! e flags globais (--max-attempts, --spacing-ms, --store, --verbose).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// massblock: bloqueio de contas em massa num fórum, com progresso persistente.
#[derive(Debug, Parser)]
#[command(name = "massblock", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Tentativas por usuário antes de desistir de uma falha transitória.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Intervalo mínimo entre chamadas ao fórum, em milissegundos.
    #[arg(long, global = true)]
    pub spacing_ms: Option<u64>,

    /// Arquivo onde a operação é persistida.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bloqueia os usuários informados (Ctrl-C para parar após o usuário atual).
    Run {
        /// Nomes de usuário a bloquear.
        usernames: Vec<String>,

        /// Arquivo com um nome de usuário por linha (`#` inicia comentário).
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Mostra a operação atual ou a última concluída.
    Status {
        /// Imprime a resposta `getBlockingStatus` em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Atende o protocolo JSON em stdin/stdout, uma mensagem por linha.
    Serve,

    /// Executa uma demonstração contra um fórum simulado.
    Demo,
}

/// Lê nomes de usuário de um texto, um por linha, ignorando linhas vazias e comentários.
pub fn parse_username_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["massblock", "run", "alice", "@bob"]);
        match cli.command {
            Command::Run { usernames, file } => {
                assert_eq!(usernames, vec!["alice", "@bob"]);
                assert!(file.is_none());
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "massblock",
            "--max-attempts",
            "5",
            "--spacing-ms",
            "2000",
            "--store",
            "/tmp/op.json",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.max_attempts, Some(5));
        assert_eq!(cli.spacing_ms, Some(2000));
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/op.json")));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_parses_status_json() {
        let cli = Cli::parse_from(["massblock", "status", "--json"]);
        assert!(matches!(cli.command, Command::Status { json: true }));
    }

    #[test]
    fn username_list_skips_blanks_and_comments() {
        let contents = "alice\n\n# spammers\nbob  # joined today\n   \ncarol\n";
        assert_eq!(parse_username_list(contents), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_serve_subcommand() {
        let cli = Cli::parse_from(["massblock", "serve", "--store", "/tmp/op.json"]);
        assert!(matches!(cli.command, Command::Serve));
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/op.json")));
    }
}
