// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! The LightLDA Metropolis-Hastings document sampler.
//!
//! Each token's topic is resampled by running `mh_steps` cycles of a
//! word-proposal step followed by a doc-proposal step. The proposals are
//! cheap to draw (an alias-table lookup, or a uniform pick over the
//! document's own tokens), and the acceptance ratio restores the correct
//! posterior. The "minus-self" correction removes the token being
//! resampled from the counters it contributed to; during inference the
//! word and summary counters are frozen, so `subtractor` collapses that
//! part of the correction to zero.
//!
//! A document is sampled from its cursor up to the last word of the
//! current slice, because only that vocabulary range has model and alias
//! rows resident. The cursor is left pointing at the first token of the
//! next slice.
//!
//! One sampler per worker thread: it owns the thread's RNG and doc-topic
//! counter and is never shared.

use thiserror::Error;

use crate::alias::BoundAlias;
use crate::config::{Config, MAX_DOC_LENGTH};
use crate::document::Document;
use crate::model::row::TopicCounter;
use crate::model::ModelAccess;
use crate::rng::XorshiftRng;

/// A corrupt proposal. This aborts the run: an out-of-range topic means
/// the alias arena or its index is broken and every count after it would
/// be garbage.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("invalid topic {topic} proposed for word {word}")]
    InvalidTopic { word: i32, topic: i32 },
}

pub struct LightDocSampler {
    alpha: f32,
    beta: f32,
    alpha_sum: f32,
    beta_sum: f32,
    num_topics: i32,
    mh_steps: usize,
    /// 1 during training, 0 during inference.
    subtractor: f32,
    approx: bool,
    emit_deltas: bool,
    rng: XorshiftRng,
    doc_topic: TopicCounter,
}

impl LightDocSampler {
    pub fn new(cfg: &Config, seed: u32) -> Self {
        LightDocSampler {
            alpha: cfg.alpha,
            beta: cfg.beta,
            alpha_sum: cfg.alpha_sum(),
            beta_sum: cfg.beta_sum(),
            num_topics: cfg.num_topics as i32,
            mh_steps: cfg.mh_steps,
            subtractor: if cfg.inference { 0.0 } else { 1.0 },
            approx: cfg.approx_sampler,
            emit_deltas: !cfg.inference,
            rng: XorshiftRng::from_seed(seed),
            doc_topic: TopicCounter::with_capacity(MAX_DOC_LENGTH),
        }
    }

    /// Resample one document's tokens within the current slice. Returns
    /// the number of tokens visited.
    pub fn sample_doc<M: ModelAccess>(
        &mut self,
        doc: &Document<'_>,
        slice: usize,
        last_word: i32,
        model: &M,
        alias: BoundAlias<'_>,
    ) -> Result<usize, SamplerError> {
        self.doc_topic.clear();
        doc.accumulate_topics(&mut self.doc_topic);

        if slice == 0 {
            doc.set_cursor(0);
        }
        let mut cursor = doc.cursor();
        let mut tokens = 0usize;
        while cursor < doc.len() {
            let word = doc.word(cursor);
            if word > last_word {
                break;
            }
            let old_topic = doc.topic(cursor);
            let new_topic = if self.approx {
                self.sample_token_approx(doc, word, old_topic, model, alias)?
            } else {
                self.sample_token(doc, word, old_topic, model, alias)?
            };
            if new_topic != old_topic {
                doc.set_topic(cursor, new_topic);
                self.doc_topic.add(old_topic, -1);
                self.doc_topic.add(new_topic, 1);
                if self.emit_deltas {
                    model.add_word_topic(word, old_topic, -1);
                    model.add_summary(old_topic, -1);
                    model.add_word_topic(word, new_topic, 1);
                    model.add_summary(new_topic, 1);
                }
            }
            tokens += 1;
            cursor += 1;
        }
        doc.set_cursor(cursor);
        Ok(tokens)
    }

    /// Doc-topic counter of the most recently sampled document, reused by
    /// the likelihood evaluation.
    pub fn doc_topic_counter(&mut self) -> &mut TopicCounter {
        &mut self.doc_topic
    }

    /// One token's full MH chain with the exact acceptance ratio.
    fn sample_token<M: ModelAccess>(
        &mut self,
        doc: &Document<'_>,
        word: i32,
        old_topic: i32,
        model: &M,
        alias: BoundAlias<'_>,
    ) -> Result<i32, SamplerError> {
        let row = model.word_topic_row(word);
        let summary = model.summary_row();
        let mut s = old_topic;

        for _ in 0..self.mh_steps {
            // Word proposal.
            let t = alias.propose(word, &mut self.rng);
            if t < 0 || t >= self.num_topics {
                return Err(SamplerError::InvalidTopic { word, topic: t });
            }
            if t != s {
                let rejection = self.rng.rand_double();

                let w_t_cnt = row.get(t) as f32;
                let w_s_cnt = row.get(s) as f32;
                let n_t = summary.get(t) as f32;
                let n_s = summary.get(s) as f32;

                let mut n_td_alpha = self.doc_topic.get(t) as f32 + self.alpha;
                let mut n_sd_alpha = self.doc_topic.get(s) as f32 + self.alpha;
                let mut n_tw_beta = w_t_cnt + self.beta;
                let mut n_t_beta_sum = n_t + self.beta_sum;
                let mut n_sw_beta = w_s_cnt + self.beta;
                let mut n_s_beta_sum = n_s + self.beta_sum;
                if s == old_topic {
                    n_sd_alpha -= 1.0;
                    n_sw_beta -= self.subtractor;
                    n_s_beta_sum -= self.subtractor;
                }
                if t == old_topic {
                    n_td_alpha -= 1.0;
                    n_tw_beta -= self.subtractor;
                    n_t_beta_sum -= self.subtractor;
                }

                let proposal_s = (w_s_cnt + self.beta) / (n_s + self.beta_sum);
                let proposal_t = (w_t_cnt + self.beta) / (n_t + self.beta_sum);

                let nominator = n_td_alpha * n_tw_beta * n_s_beta_sum * proposal_s;
                let denominator = n_sd_alpha * n_sw_beta * n_t_beta_sum * proposal_t;
                let pi = f64::from(nominator / denominator);

                let m = -i32::from(rejection < pi);
                s = (t & m) | (s & !m);
            }

            // Doc proposal: a uniform token from the document, or the
            // alpha-smoothed uniform over all topics.
            let x = self.rng.rand_double() * (doc.len() as f64 + f64::from(self.alpha_sum));
            let t = if x < doc.len() as f64 {
                doc.topic(x as usize)
            } else {
                self.rng.rand_k(self.num_topics)
            };
            if t != s {
                let rejection = self.rng.rand_double();

                let w_t_cnt = row.get(t) as f32;
                let w_s_cnt = row.get(s) as f32;
                let n_t = summary.get(t) as f32;
                let n_s = summary.get(s) as f32;

                let mut n_td_alpha = self.doc_topic.get(t) as f32 + self.alpha;
                let mut n_sd_alpha = self.doc_topic.get(s) as f32 + self.alpha;
                let mut n_tw_beta = w_t_cnt + self.beta;
                let mut n_t_beta_sum = n_t + self.beta_sum;
                let mut n_sw_beta = w_s_cnt + self.beta;
                let mut n_s_beta_sum = n_s + self.beta_sum;
                if s == old_topic {
                    n_sd_alpha -= 1.0;
                    n_sw_beta -= self.subtractor;
                    n_s_beta_sum -= self.subtractor;
                }
                if t == old_topic {
                    n_td_alpha -= 1.0;
                    n_tw_beta -= self.subtractor;
                    n_t_beta_sum -= self.subtractor;
                }

                let proposal_s = self.doc_topic.get(s) as f32 + self.alpha;
                let proposal_t = self.doc_topic.get(t) as f32 + self.alpha;

                let nominator = n_td_alpha * n_tw_beta * n_s_beta_sum * proposal_s;
                let denominator = n_sd_alpha * n_sw_beta * n_t_beta_sum * proposal_t;
                let pi = f64::from(nominator / denominator);

                let m = -i32::from(rejection < pi);
                s = (t & m) | (s & !m);
            }
        }
        Ok(s)
    }

    /// The approximate chain: drops one factor from each side of the
    /// acceptance ratio. Converges comparably in practice and trades a
    /// little mixing quality for fewer counter reads.
    fn sample_token_approx<M: ModelAccess>(
        &mut self,
        doc: &Document<'_>,
        word: i32,
        old_topic: i32,
        model: &M,
        alias: BoundAlias<'_>,
    ) -> Result<i32, SamplerError> {
        let row = model.word_topic_row(word);
        let summary = model.summary_row();
        let mut s = old_topic;

        for _ in 0..self.mh_steps {
            let t = alias.propose(word, &mut self.rng);
            if t < 0 || t >= self.num_topics {
                return Err(SamplerError::InvalidTopic { word, topic: t });
            }
            if t != s {
                let mut nominator = self.doc_topic.get(t) as f32 + self.alpha;
                let mut denominator = self.doc_topic.get(s) as f32 + self.alpha;
                if t == old_topic {
                    nominator -= 1.0;
                }
                if s == old_topic {
                    denominator -= 1.0;
                }
                let pi = f64::from(nominator / denominator);
                let rejection = self.rng.rand_double();
                let m = -i32::from(rejection < pi);
                s = (t & m) | (s & !m);
            }

            let x = self.rng.rand_double() * (doc.len() as f64 + f64::from(self.alpha_sum));
            let t = if x < doc.len() as f64 {
                doc.topic(x as usize)
            } else {
                self.rng.rand_k(self.num_topics)
            };
            if t != s {
                let mut n_tw_beta = row.get(t) as f32 + self.beta;
                let mut n_sw_beta = row.get(s) as f32 + self.beta;
                let mut n_t_beta_sum = summary.get(t) as f32 + self.beta_sum;
                let mut n_s_beta_sum = summary.get(s) as f32 + self.beta_sum;
                if t == old_topic {
                    n_tw_beta -= self.subtractor;
                    n_t_beta_sum -= self.subtractor;
                }
                if s == old_topic {
                    n_sw_beta -= self.subtractor;
                    n_s_beta_sum -= self.subtractor;
                }
                let pi = f64::from((n_tw_beta * n_s_beta_sum) / (n_sw_beta * n_t_beta_sum));
                let rejection = self.rng.rand_double();
                let m = -i32::from(rejection < pi);
                s = (t & m) | (s & !m);
            }
        }
        Ok(s)
    }
}
