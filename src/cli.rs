//! Interface de linha de comando do repairflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] e flags globais
//! (--config, --verbose, --json).

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::state_machine::{JobState, Priority};

/// repairflow: motor de fluxo de trabalho para fichas de reparo.
#[derive(Debug, Parser)]
#[command(name = "repairflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./repairflow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Imprime resultados como JSON em vez de texto formatado.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

/// Prioridade aceita pela CLI, mapeada para [`Priority`] internamente.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
    /// Escala na metade do tempo limite do estado.
    Urgent,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Urgent => Priority::Urgent,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Abre uma nova ficha de reparo no estado CREATED.
    Create {
        /// Referência do cliente.
        #[arg(long)]
        customer: String,

        /// Referência do aparelho.
        #[arg(long)]
        device: String,

        /// Técnico responsável, se já definido.
        #[arg(long)]
        technician: Option<String>,

        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,

        /// Descrição do defeito relatado.
        #[arg(long, default_value = "")]
        problem: String,

        /// Custo estimado em centavos.
        #[arg(long)]
        estimate: Option<i64>,
    },

    /// Mostra um job pelo id ou pelo número (JS-...).
    Show {
        job: String,
    },

    /// Move um job para outro estado.
    Transition {
        /// Id ou número do job.
        job: String,

        /// Estado de destino, ex.: IN_DIAGNOSIS.
        to: JobState,

        /// Quem solicita a transição.
        #[arg(long, default_value = "cli")]
        actor: String,

        /// Motivo registrado na auditoria (obrigatório para CANCELLED).
        #[arg(long, default_value = "")]
        reason: String,

        /// Chave de idempotência da requisição.
        #[arg(long)]
        request_id: Option<String>,

        /// Metadados extras no formato chave=valor (repetível).
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Edita a documentação de um job.
    Document(DocumentArgs),

    /// Lista jobs, opcionalmente filtrando por estado.
    List {
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Mostra o catálogo de estados.
    Catalog,

    /// Mostra indicadores agregados do fluxo.
    Analytics,

    /// Exporta a trilha de auditoria de um job.
    Audit {
        job: String,
    },

    /// Reexecuta as automações da última transição de um job.
    Redispatch {
        job: String,
    },

    /// Executa a varredura de escalonamento.
    Sweep {
        /// Continua varrendo no intervalo configurado até Ctrl-C.
        #[arg(long, default_value_t = false)]
        watch: bool,
    },

    /// Executa a demonstração embutida do ciclo de vida completo.
    Demo,
}

#[derive(Debug, Args)]
pub struct DocumentArgs {
    /// Id ou número do job.
    pub job: String,

    /// Quem faz a alteração.
    #[arg(long, default_value = "cli")]
    pub actor: String,

    #[command(subcommand)]
    pub action: DocumentAction,
}

#[derive(Debug, Subcommand)]
pub enum DocumentAction {
    /// Atribui o técnico responsável.
    Technician { technician: String },

    /// Anexa uma foto.
    Photo { url: String },

    /// Registra o diagnóstico (apenas em IN_DIAGNOSIS).
    Diagnosis {
        #[arg(long)]
        notes: String,

        /// Horas de mão de obra estimadas.
        #[arg(long)]
        hours: f32,

        /// Custo estimado em centavos.
        #[arg(long)]
        cost: Option<i64>,
    },

    /// Registra o resultado dos testes (apenas em TESTING).
    Tests { results: String },

    /// Registra a inspeção de qualidade (apenas em QUALITY_CHECK).
    Quality {
        #[arg(long)]
        score: u8,

        #[arg(long)]
        inspector: String,

        /// Problema encontrado (repetível).
        #[arg(long = "issue")]
        issues: Vec<String>,
    },

    /// Define o custo final em centavos.
    FinalCost { cents: i64 },
}
