//! AN-042: Application model — board plus editor, wired from config.

pub mod board;
pub mod session;

pub use board::Board;
pub use session::EditorSession;

use crate::core::config::AncileConfig;
use crate::core::error::Result;
use crate::core::store::Store;
use crate::core::types::Card;
use crate::provision::{EnvBuilder, Provisioner, PythonVenv};
use std::sync::Arc;

/// Everything the front end needs, built from one config.
pub struct App {
    pub board: Board,
    pub session: EditorSession,
    pub provisioner: Arc<Provisioner>,
}

impl App {
    /// Open the configured database and use the real `venv` builder.
    pub fn open(config: &AncileConfig) -> Result<Self> {
        let builder = Box::new(PythonVenv::new(config.python.clone()));
        Self::with_builder(config, builder)
    }

    pub fn with_builder(config: &AncileConfig, builder: Box<dyn EnvBuilder>) -> Result<Self> {
        let store = Store::open(&config.database_path())?;
        let provisioner = Arc::new(Provisioner::new(config.venvs_path(), builder));
        let session = EditorSession::new(
            provisioner.clone(),
            config.scripts_path(),
            config.stop_grace(),
        );
        Ok(Self {
            board: Board::new(store),
            session,
            provisioner,
        })
    }

    /// Open a card in the editor.
    pub fn open_card(&mut self, card: &Card) -> Result<()> {
        self.session
            .open(self.board.store(), &card.title, &card.description)
    }

    pub fn save(&self) -> Result<()> {
        self.session.save(self.board.store())
    }
}
