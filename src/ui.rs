//! Interface de terminal do massblock: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`ProgressWidget`] é um observador como qualquer
//! outro: ao se conectar consulta o status atual e depois segue os pushes.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::bus::{MessageBus, ProgressAction, ProgressUpdate, Request, StatusData};
use crate::state_machine::OperationStatus;

/// Indicador visual de progresso para uma operação de bloqueio.
///
/// Sucesso é exibido em verde, parada pelo usuário em amarelo e falha em
/// vermelho; uma operação falha nunca é exibida como concluída.
pub struct ProgressWidget {
    // Barra ativa; `None` enquanto não há operação em andamento.
    pb: Option<ProgressBar>,
    green: Style,
    red: Style,
    yellow: Style,
}

impl Default for ProgressWidget {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressWidget {
    pub fn new() -> Self {
        Self {
            pb: None,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Conecta ao barramento, reconcilia com o status atual e acompanha a
    /// operação até o fim. Retorna o status final, se houver operação.
    pub async fn follow(bus: &MessageBus) -> Option<StatusData> {
        let mut widget = Self::new();
        // Inscreve antes de consultar para não perder pushes entre as duas etapas.
        let mut observer = bus.observe();

        let status = bus.dispatch(Request::GetBlockingStatus).await.data;
        match &status {
            Some(data) if data.is_processing => widget.reconcile(data),
            _ => {
                if let Some(data) = &status {
                    widget.print_summary(data);
                }
                return status;
            }
        }

        while let Some(update) = observer.next().await {
            widget.render(&update);
            if update.is_final() {
                break;
            }
        }

        let status = bus.dispatch(Request::GetBlockingStatus).await.data;
        if let Some(data) = &status {
            widget.print_summary(data);
        }
        status
    }

    /// Reconstrói a barra a partir de um snapshot completo.
    pub fn reconcile(&mut self, status: &StatusData) {
        let pb = self.bar(status.total_users);
        pb.set_position(status.processed_users as u64);
        let message = match &status.current_user {
            Some(user) => format!("Blocking @{user}"),
            None => format!("{} of {} users processed", status.processed_users, status.total_users),
        };
        pb.set_message(message);
    }

    /// Aplica um push de progresso.
    pub fn render(&mut self, update: &ProgressUpdate) {
        match update.action {
            ProgressAction::Show => {
                let pb = self.bar(update.total);
                pb.set_position(update.current as u64);
                pb.set_message(update.message.clone());
            }
            ProgressAction::Update => {
                let pb = self.bar(update.total);
                pb.set_position(update.current as u64);
                let message = match update.countdown_seconds {
                    Some(secs) => format!("{} ({secs}s)", update.message),
                    None => update.message.clone(),
                };
                pb.set_message(message);
            }
            ProgressAction::Hide => {
                if let Some(pb) = self.pb.take() {
                    pb.finish_and_clear();
                }
            }
        }
    }

    /// Imprime o resultado final com a lista de usuários que falharam.
    pub fn print_summary(&self, status: &StatusData) {
        let line = format!(
            "{} of {} users processed, {} blocked",
            status.processed_users, status.total_users, status.blocked_users
        );
        match status.status {
            OperationStatus::Failed => {
                println!("  {} Failed: {line}", self.red.apply_to("✗"));
                if let Some(reason) = &status.failure {
                    println!("    {}", self.red.apply_to(reason));
                }
            }
            OperationStatus::Completed if status.stopped_by_user => {
                println!("  {} Stopped: {line}", self.yellow.apply_to("■"));
            }
            OperationStatus::Completed => {
                println!("  {} Completed: {line}", self.green.apply_to("✓"));
            }
            _ => {
                println!("  {} In progress: {line}", self.yellow.apply_to("…"));
            }
        }

        if !status.errors.is_empty() {
            println!("  {} {} failed:", self.red.apply_to("✗"), status.errors.len());
            for failed in &status.errors {
                println!("    @{}: {}", failed.username, failed.reason);
            }
        }
    }

    // Barra ativa, criada (ou redimensionada) para `total` usuários.
    fn bar(&mut self, total: usize) -> &ProgressBar {
        let pb = self.pb.get_or_insert_with(|| {
            let pb = ProgressBar::new(total as u64);
            if let Ok(style) =
                ProgressStyle::default_bar().template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            {
                pb.set_style(style.progress_chars("=> "));
            }
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb
        });
        pb.set_length(total as u64);
        pb
    }

    #[cfg(test)]
    fn position(&self) -> Option<(u64, Option<u64>)> {
        self.pb.as_ref().map(|pb| (pb.position(), pb.length()))
    }
}
