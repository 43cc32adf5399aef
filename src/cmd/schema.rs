//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    cmd::{process::ProcessRecord, write_output},
    config::OcrConfig,
    consensus::ConsensusResult,
    engine::{EngineReply, EngineRequest},
    prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// Request JSON passed to the OCR engine.
    EngineRequest,
    /// Reply JSON expected from the OCR engine.
    EngineReply,
    /// Stored consensus result.
    ConsensusResult,
    /// OCR configuration snapshot.
    OcrConfig,
    /// JSONL output record of the `process` subcommand.
    ProcessRecord,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::EngineRequest => schema_for!(EngineRequest),
        SchemaType::EngineReply => schema_for!(EngineReply),
        SchemaType::ConsensusResult => schema_for!(ConsensusResult),
        SchemaType::OcrConfig => schema_for!(OcrConfig),
        SchemaType::ProcessRecord => schema_for!(ProcessRecord),
    };

    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    write_output(schema_opts.output_path.as_deref(), &schema_str).await
}
