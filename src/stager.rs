use crate::db::models::Attachment;
use crate::db::Database;
use crate::store::StoreError;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Pending attachments of the conversation currently shown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingAttachments {
    pub conversation_id: String,
    pub attachments: Vec<Attachment>,
}

/// Attachments added to a conversation but not sent yet.
///
/// The observable list is updated first and rolled back if the durable write
/// fails, so observers never keep seeing an attachment that was not stored (or
/// miss one that still is).
pub struct AttachmentStager {
    db: Arc<Database>,
    pending: watch::Sender<PendingAttachments>,
}

impl AttachmentStager {
    pub fn new(db: Arc<Database>) -> Self {
        let (pending, _) = watch::channel(PendingAttachments::default());
        Self { db, pending }
    }

    pub fn subscribe(&self) -> watch::Receiver<PendingAttachments> {
        self.pending.subscribe()
    }

    /// Makes `conversation_id` the observed conversation and loads its staged files.
    pub fn load(&self, conversation_id: &str) -> Result<Vec<Attachment>, StoreError> {
        let attachments = self.db.get_pending_attachments(conversation_id)?;
        self.pending.send_replace(PendingAttachments {
            conversation_id: conversation_id.to_string(),
            attachments: attachments.clone(),
        });
        Ok(attachments)
    }

    pub fn list(&self, conversation_id: &str) -> Result<Vec<Attachment>, StoreError> {
        Ok(self.db.get_pending_attachments(conversation_id)?)
    }

    pub fn add(&self, conversation_id: &str, attachment: Attachment) -> Result<(), StoreError> {
        let observed = self.is_observed(conversation_id);
        if observed {
            self.pending
                .send_modify(|p| p.attachments.push(attachment.clone()));
        }

        if let Err(e) = self.db.insert_pending_attachment(conversation_id, &attachment) {
            warn!(conversation_id, error = %e, "staging attachment failed, rolling back");
            if observed {
                self.pending.send_modify(|p| {
                    if let Some(pos) = p.attachments.iter().rposition(|a| *a == attachment) {
                        p.attachments.remove(pos);
                    }
                });
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn remove(&self, conversation_id: &str, attachment: &Attachment) -> Result<(), StoreError> {
        let mut removed_at = None;
        if self.is_observed(conversation_id) {
            self.pending.send_if_modified(|p| {
                removed_at = p.attachments.iter().position(|a| a == attachment);
                match removed_at {
                    Some(pos) => {
                        p.attachments.remove(pos);
                        true
                    }
                    None => false,
                }
            });
        }

        if let Err(e) = self.db.delete_pending_attachment(conversation_id, attachment) {
            warn!(conversation_id, error = %e, "unstaging attachment failed, rolling back");
            if let Some(pos) = removed_at {
                self.pending.send_modify(|p| {
                    let pos = pos.min(p.attachments.len());
                    p.attachments.insert(pos, attachment.clone());
                });
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.take(conversation_id).map(|_| ())
    }

    /// Removes and returns everything staged for `conversation_id`.
    pub fn take(&self, conversation_id: &str) -> Result<Vec<Attachment>, StoreError> {
        let staged = self.db.get_pending_attachments(conversation_id)?;
        self.db.clear_pending_attachments(conversation_id)?;
        if self.is_observed(conversation_id) {
            self.pending
                .send_if_modified(|p| !std::mem::take(&mut p.attachments).is_empty());
        }
        Ok(staged)
    }

    fn is_observed(&self, conversation_id: &str) -> bool {
        self.pending.borrow().conversation_id == conversation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (AttachmentStager, Arc<Database>) {
        let db = Arc::new(Database::in_memory().unwrap());
        (AttachmentStager::new(db.clone()), db)
    }

    fn break_table(db: &Database) {
        db.conn
            .lock()
            .execute_batch("DROP TABLE pending_attachments;")
            .unwrap();
    }

    #[test]
    fn test_add_and_remove_keep_layers_in_sync() {
        let (stager, _) = setup();
        let rx = stager.subscribe();
        stager.load("c1").unwrap();

        let image = Attachment::image("cat", "https://img/cat.jpg");
        let pdf = Attachment::pdf("doc.pdf", "/tmp/doc.pdf");
        stager.add("c1", image.clone()).unwrap();
        stager.add("c1", pdf.clone()).unwrap();
        assert_eq!(rx.borrow().attachments, vec![image.clone(), pdf.clone()]);
        assert_eq!(stager.list("c1").unwrap(), vec![image.clone(), pdf.clone()]);

        stager.remove("c1", &image).unwrap();
        assert_eq!(rx.borrow().attachments, vec![pdf.clone()]);
        assert_eq!(stager.list("c1").unwrap(), vec![pdf]);
    }

    #[test]
    fn test_failed_add_rolls_back() {
        let (stager, db) = setup();
        let rx = stager.subscribe();
        stager.load("c1").unwrap();
        break_table(&db);

        assert!(stager.add("c1", Attachment::image("cat", "u")).is_err());
        assert!(rx.borrow().attachments.is_empty());
    }

    #[test]
    fn test_failed_remove_rolls_back() {
        let (stager, db) = setup();
        let rx = stager.subscribe();
        stager.load("c1").unwrap();
        let first = Attachment::image("a", "u1");
        let second = Attachment::image("b", "u2");
        stager.add("c1", first.clone()).unwrap();
        stager.add("c1", second.clone()).unwrap();
        break_table(&db);

        assert!(stager.remove("c1", &first).is_err());
        assert_eq!(rx.borrow().attachments, vec![first, second]);
    }

    #[test]
    fn test_other_conversation_is_not_observed() {
        let (stager, _) = setup();
        let rx = stager.subscribe();
        stager.load("c1").unwrap();

        stager.add("c2", Attachment::image("a", "u")).unwrap();
        assert!(rx.borrow().attachments.is_empty());
        assert_eq!(stager.load("c2").unwrap().len(), 1);
        assert_eq!(rx.borrow().conversation_id, "c2");
    }

    #[test]
    fn test_take_clears_both_layers() {
        let (stager, _) = setup();
        let rx = stager.subscribe();
        stager.load("c1").unwrap();
        stager.add("c1", Attachment::image("a", "u")).unwrap();

        let taken = stager.take("c1").unwrap();
        assert_eq!(taken.len(), 1);
        assert!(rx.borrow().attachments.is_empty());
        assert!(stager.list("c1").unwrap().is_empty());
    }
}
