// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    errors::StoreError,
    store::{Row, ScriptExecutor},
};

/// Named default subscriber set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// One subscriber of a [`SubTemplate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubTemplateDetail {
    pub id: String,
    pub template_id: String,
    pub receiver_tag: String,
    pub exchange: String,
    pub route_key: String,
}

impl SubTemplate {
    pub async fn find_by_name(
        name: &str,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Option<SubTemplate>, StoreError> {
        let Some(row) = exec.query_script_row("FindOneTemplate", &[name.into()]).await? else {
            return Ok(None);
        };

        Ok(Some(SubTemplate {
            id: row.text("id")?,
            name: row.text("name")?,
            description: row.text("description")?,
        }))
    }

    pub async fn fetch_details(
        &self,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Vec<SubTemplateDetail>, StoreError> {
        exec.query_script("FetchSubTemplateDetails", &[self.id.as_str().into()])
            .await?
            .iter()
            .map(SubTemplateDetail::from_row)
            .collect()
    }
}

impl SubTemplateDetail {
    fn from_row(row: &Row) -> Result<SubTemplateDetail, StoreError> {
        Ok(SubTemplateDetail {
            id: row.text("id")?,
            template_id: row.text("template_id")?,
            receiver_tag: row.text("receiver_tag")?,
            exchange: row.text("exchange")?,
            route_key: row.text("route_key")?,
        })
    }
}
